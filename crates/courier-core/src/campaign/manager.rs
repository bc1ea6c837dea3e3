//! Campaign Manager - operator-facing lifecycle actions

use super::begin_run;
use crate::dispatch::{refresh_counters, skip_pending, Dispatcher, RunSignal};
use crate::settings::{check_activation, ConfigError, EffectivePolicy, LimitViolation};
use courier_common::types::CampaignId;
use courier_common::{GlobalSettings, VersionedSettings};
use courier_storage::{
    Campaign, CampaignState, CampaignTransition, Message, MessageStatus, NewCampaign,
    PauseReason, StateChange, TransitionReason,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

/// Campaign manager errors
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign not found")]
    NotFound,

    #[error("Cannot move campaign from {from} to {to}")]
    InvalidTransition {
        from: CampaignState,
        to: CampaignState,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    LimitExceeded(#[from] LimitViolation),

    #[error(transparent)]
    Storage(#[from] courier_common::Error),
}

pub type Result<T> = std::result::Result<T, CampaignError>;

/// Campaign Manager - activation, pause, resume, cancel and queries
pub struct CampaignManager {
    dispatcher: Arc<Dispatcher>,
    settings: watch::Sender<Arc<VersionedSettings>>,
}

impl CampaignManager {
    pub fn new(dispatcher: Arc<Dispatcher>, settings: watch::Sender<Arc<VersionedSettings>>) -> Self {
        Self {
            dispatcher,
            settings,
        }
    }

    /// Store a new DRAFT campaign
    pub async fn create(&self, input: NewCampaign) -> Result<Campaign> {
        let campaign = self.dispatcher.context().stores.campaigns.create(input).await?;
        info!(campaign_id = %campaign.id, name = %campaign.name, "Campaign created");
        Ok(campaign)
    }

    async fn load(&self, id: CampaignId) -> Result<Campaign> {
        self.dispatcher
            .context()
            .stores
            .campaigns
            .get(id)
            .await?
            .ok_or(CampaignError::NotFound)
    }

    /// Apply a state change or report the state that prevented it
    async fn transition(&self, id: CampaignId, change: StateChange) -> Result<Campaign> {
        let to = change.to;
        let reason = change.reason;
        match self
            .dispatcher
            .context()
            .stores
            .campaigns
            .transition(id, change)
            .await?
        {
            Some(campaign) => {
                info!(
                    campaign_id = %id,
                    state = %campaign.state,
                    reason = %reason,
                    "Campaign state changed"
                );
                Ok(campaign)
            }
            None => {
                let current = self.load(id).await?;
                Err(CampaignError::InvalidTransition {
                    from: current.state,
                    to,
                })
            }
        }
    }

    /// Validate a DRAFT campaign against settings and tenant limits, then
    /// schedule it or start dispatching
    pub async fn activate(&self, id: CampaignId) -> Result<Campaign> {
        let ctx = self.dispatcher.context();
        let campaign = self.load(id).await?;
        if campaign.state != CampaignState::Draft {
            return Err(CampaignError::InvalidTransition {
                from: campaign.state,
                to: CampaignState::Queued,
            });
        }

        let snapshot = self.settings.borrow().clone();
        let limits = ctx.stores.settings.user_limits(campaign.owner_id).await?;
        EffectivePolicy::resolve(&snapshot, limits.as_ref(), &campaign)?;

        let template = ctx.stores.templates.get(campaign.template_id).await?;
        if !template.is_some_and(|t| !t.items.is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "template_id",
                reason: "template is missing or has no items".to_string(),
            }
            .into());
        }

        let active = ctx
            .stores
            .campaigns
            .count_active_by_owner(campaign.owner_id)
            .await?;
        check_activation(limits.as_ref(), &campaign, active)?;

        let now = ctx.clock.now();
        if campaign.scheduled_at.is_some_and(|at| at > now) {
            let change = StateChange::new(
                &[CampaignState::Draft],
                CampaignState::Scheduled,
                TransitionReason::Activated,
                now,
            );
            return self.transition(id, change).await;
        }

        let change = StateChange::new(
            &[CampaignState::Draft],
            CampaignState::Queued,
            TransitionReason::Activated,
            now,
        );
        let campaign = self.transition(id, change).await?;
        let campaign = begin_run(ctx, &campaign, now).await?;
        self.dispatcher.start(id);
        Ok(campaign)
    }

    /// Stop issuing new sends; in-flight sends complete
    pub async fn pause(&self, id: CampaignId) -> Result<Campaign> {
        let now = self.dispatcher.context().clock.now();
        let change = StateChange::new(
            &[CampaignState::Queued, CampaignState::Running],
            CampaignState::Paused,
            TransitionReason::ManualPause,
            now,
        )
        .with_pause_reason(PauseReason::Manual);
        let campaign = self.transition(id, change).await?;
        self.dispatcher.signal(id, RunSignal::Pause);
        Ok(campaign)
    }

    /// Resume a paused campaign with a fresh candidate order
    pub async fn resume(&self, id: CampaignId) -> Result<Campaign> {
        let now = self.dispatcher.context().clock.now();
        let change = StateChange::new(
            &[CampaignState::Paused],
            CampaignState::Queued,
            TransitionReason::ManualResume,
            now,
        );
        let campaign = self.transition(id, change).await?;
        resume_run(&self.dispatcher, &campaign).await?;
        Ok(campaign)
    }

    /// Cancel a campaign; pending messages are skipped once in-flight sends
    /// complete
    pub async fn cancel(&self, id: CampaignId) -> Result<Campaign> {
        let ctx = self.dispatcher.context();
        let now = ctx.clock.now();
        let change = StateChange::new(
            &[
                CampaignState::Scheduled,
                CampaignState::Queued,
                CampaignState::Running,
                CampaignState::Paused,
            ],
            CampaignState::Cancelled,
            TransitionReason::Cancelled,
            now,
        );
        let campaign = self.transition(id, change).await?;

        if !self.dispatcher.signal(id, RunSignal::Cancel) && campaign.run > 0 {
            let skipped = skip_pending(&ctx.stores, id, campaign.run, "campaign cancelled", now).await?;
            refresh_counters(&ctx.stores, id, campaign.run).await?;
            info!(campaign_id = %id, skipped, "Skipped pending messages of cancelled campaign");
        }
        Ok(campaign)
    }

    /// Current campaign row, including state, pause reason and counters
    pub async fn status(&self, id: CampaignId) -> Result<Campaign> {
        self.load(id).await
    }

    /// Recorded state changes, oldest first
    pub async fn transitions(&self, id: CampaignId) -> Result<Vec<CampaignTransition>> {
        Ok(self
            .dispatcher
            .context()
            .stores
            .campaigns
            .transitions(id)
            .await?)
    }

    pub async fn messages(
        &self,
        id: CampaignId,
        status: Option<MessageStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        Ok(self
            .dispatcher
            .context()
            .stores
            .messages
            .list_by_campaign(id, status, limit, offset)
            .await?)
    }

    /// Current global settings snapshot
    pub fn global_settings(&self) -> Arc<VersionedSettings> {
        self.settings.borrow().clone()
    }

    /// Persist new global settings and publish them to running campaigns
    pub async fn update_global_settings(
        &self,
        settings: GlobalSettings,
    ) -> Result<Arc<VersionedSettings>> {
        settings
            .validate()
            .map_err(|e| ConfigError::InvalidValue {
                field: "global_settings",
                reason: e.to_string(),
            })?;

        let ctx = self.dispatcher.context();
        let saved = Arc::new(ctx.stores.settings.save_global(settings, ctx.clock.now()).await?);
        self.settings.send_replace(saved.clone());
        info!(version = saved.version, "Global settings updated");
        Ok(saved)
    }
}

/// Re-seed the candidate order and start a run for a campaign that just
/// moved from PAUSED to QUEUED. A run still draining is picked up by the
/// supervisor once it exits.
pub(crate) async fn resume_run(
    dispatcher: &Dispatcher,
    campaign: &Campaign,
) -> courier_common::Result<()> {
    let ctx = dispatcher.context();
    ctx.stores
        .campaigns
        .set_run_seed(campaign.id, rand::random())
        .await?;
    if !dispatcher.start(campaign.id) {
        warn!(campaign_id = %campaign.id, "Previous run still active, resume deferred");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::testing::{sample_new_campaign, TestEngine};
    use courier_common::UserCampaignLimits;
    use courier_storage::SettingsRepository;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_activate_rejects_missing_work_hours() {
        let engine = TestEngine::new(2, 0);
        let mut input = sample_new_campaign();
        input.template_id = engine.template_id;
        input.schedule.work_hours_enabled = true;
        let campaign = engine.manager.create(input).await.unwrap();

        let err = engine.manager.activate(campaign.id).await.unwrap_err();
        assert!(matches!(
            err,
            CampaignError::Config(ConfigError::MissingField { .. })
        ));
        let campaign = engine.manager.status(campaign.id).await.unwrap();
        assert_eq!(campaign.state, CampaignState::Draft);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_enforces_tenant_limit() {
        let engine = TestEngine::new(2, 0);
        let first = engine.draft().await;
        engine
            .stores
            .settings
            .save_user_limits(UserCampaignLimits {
                max_active_campaigns: Some(1),
                ..UserCampaignLimits::unrestricted(first.owner_id)
            })
            .await
            .unwrap();

        // Future start keeps the first campaign SCHEDULED (active, no run)
        let mut input = sample_new_campaign();
        input.owner_id = first.owner_id;
        input.template_id = engine.template_id;
        input.scheduled_at = Some(engine.clock.now() + chrono::Duration::days(1));
        let scheduled = engine.manager.create(input).await.unwrap();
        let scheduled = engine.manager.activate(scheduled.id).await.unwrap();
        assert_eq!(scheduled.state, CampaignState::Scheduled);

        let err = engine.manager.activate(first.id).await.unwrap_err();
        assert!(matches!(
            err,
            CampaignError::LimitExceeded(LimitViolation::TooManyActive { max: 1 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_transition_reports_state() {
        let engine = TestEngine::new(1, 0);
        let campaign = engine.draft().await;
        let err = engine.manager.resume(campaign.id).await.unwrap_err();
        match err {
            CampaignError::InvalidTransition { from, to } => {
                assert_eq!(from, CampaignState::Draft);
                assert_eq!(to, CampaignState::Queued);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_global_settings_publishes_version() {
        let engine = TestEngine::new(1, 0);
        let before = engine.manager.global_settings().version;
        let saved = engine
            .manager
            .update_global_settings(GlobalSettings {
                max_contacts_per_hour: 5,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(saved.version > before);
        assert_eq!(engine.manager.global_settings().settings.max_contacts_per_hour, 5);

        let invalid = GlobalSettings {
            retry_backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(engine.manager.update_global_settings(invalid).await.is_err());
    }
}
