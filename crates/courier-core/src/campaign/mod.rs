//! Campaign lifecycle: operator actions, the background supervisor and
//! the retention sweep

mod manager;
mod supervisor;

pub use manager::{CampaignError, CampaignManager};
pub use supervisor::{RecoveryReport, Supervisor};

use crate::dispatch::EngineContext;
use crate::eligibility::estimate_total;
use crate::notify::Notification;
use chrono::{DateTime, Utc};
use courier_common::GlobalSettings;
use courier_storage::Campaign;
use tracing::info;

/// Begin a new run of a campaign: fresh ordering seed, recipient estimate
/// and zeroed counters
pub(crate) async fn begin_run(
    ctx: &EngineContext,
    campaign: &Campaign,
    now: DateTime<Utc>,
) -> courier_common::Result<Campaign> {
    let total = estimate_total(&ctx.stores, campaign, ctx.config.candidate_batch_size).await?;
    let seed: i64 = rand::random();
    let campaign = ctx.stores.campaigns.start_run(campaign.id, seed, total, now).await?;

    info!(
        campaign_id = %campaign.id,
        run = campaign.run,
        total_recipients = total,
        "Campaign run begun"
    );
    ctx.notifier.notify(Notification::CampaignStarted {
        campaign_id: campaign.id,
        name: campaign.name.clone(),
        run: campaign.run,
    });
    Ok(campaign)
}

/// Whether an interrupted or auto-paused campaign may continue on its own
pub(crate) fn auto_resume_enabled(campaign: &Campaign, settings: &GlobalSettings) -> bool {
    campaign
        .options
        .auto_resume
        .unwrap_or(settings.auto_resume_after_restart)
}

/// Next start of a recurring campaign after `now`, if one remains before
/// the recurrence end date
pub(crate) fn next_occurrence(campaign: &Campaign, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let recurrence = campaign.schedule.recurrence;
    let mut next = recurrence.next_after(campaign.scheduled_at.or(campaign.started_at)?)?;
    while next <= now {
        next = recurrence.next_after(next)?;
    }
    match campaign.schedule.recurrence_end_date {
        Some(end) if next >= end => None,
        _ => Some(next),
    }
}
