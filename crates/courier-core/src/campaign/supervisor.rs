//! Campaign supervisor - starts due campaigns, restarts interrupted runs,
//! lifts automatic pauses, re-arms recurring campaigns and sweeps expired
//! campaign data

use super::manager::resume_run;
use super::{auto_resume_enabled, begin_run, next_occurrence};
use crate::dispatch::{campaign_lock, Dispatcher, RunExit};
use crate::health::ProfileEvent;
use chrono::Duration;
use courier_common::types::ProfileId;
use courier_common::Result;
use courier_storage::{Campaign, CampaignState, PauseReason, StateChange, TransitionReason};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What restart recovery did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// PROCESSING messages of dead instances returned to PENDING
    pub requeued_messages: u64,
    /// Locks whose owner stopped heartbeating
    pub released_locks: u64,
    pub resumed_campaigns: usize,
    /// Campaigns left to the live instance that runs them
    pub leased_campaigns: usize,
    /// Campaigns held in PAUSED because auto-resume is off
    pub held_campaigns: usize,
    pub rearmed_campaigns: usize,
}

/// Background lifecycle worker
pub struct Supervisor {
    dispatcher: Arc<Dispatcher>,
    events: broadcast::Receiver<ProfileEvent>,
    /// Profiles that came back since the last tick
    recovered: HashSet<ProfileId>,
}

impl Supervisor {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let events = dispatcher.context().registry.subscribe();
        Self {
            dispatcher,
            events,
            recovered: HashSet::new(),
        }
    }

    /// Bring persisted state back to a consistent point after a restart and
    /// re-enter active campaigns at the gate check.
    ///
    /// Only state left by instances whose heartbeat expired is reclaimed;
    /// messages and campaigns of live instances are left alone.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let ctx = self.dispatcher.context();
        ctx.heartbeat().await?;
        let now = ctx.clock.now();
        let expired_before = now - self.lease_ttl();
        let released_locks = ctx.stores.locks.release_expired(expired_before).await?;
        let live = ctx.stores.locks.live_owners(expired_before).await?;
        let mut report = RecoveryReport {
            requeued_messages: ctx.stores.messages.requeue_orphaned(&live, now).await?,
            released_locks,
            ..Default::default()
        };

        let settings = ctx.settings.borrow().clone();
        let active = ctx
            .stores
            .campaigns
            .list_by_states(&[CampaignState::Queued, CampaignState::Running])
            .await?;
        for campaign in active {
            if self.leased_elsewhere(&campaign).await? {
                debug!(campaign_id = %campaign.id, "Campaign is run by another instance");
                report.leased_campaigns += 1;
            } else if auto_resume_enabled(&campaign, &settings.settings) {
                self.ensure_run(&campaign).await?;
                report.resumed_campaigns += 1;
            } else {
                let change = StateChange::new(
                    &[CampaignState::Queued, CampaignState::Running],
                    CampaignState::Paused,
                    TransitionReason::Restarted,
                    now,
                )
                .with_pause_reason(PauseReason::Manual);
                if ctx.stores.campaigns.transition(campaign.id, change).await?.is_some() {
                    info!(campaign_id = %campaign.id, "Campaign held after restart");
                    report.held_campaigns += 1;
                }
            }
        }

        let completed = ctx
            .stores
            .campaigns
            .list_by_states(&[CampaignState::Completed])
            .await?;
        for campaign in completed {
            if self.rearm(&campaign).await? {
                report.rearmed_campaigns += 1;
            }
        }

        info!(
            requeued = report.requeued_messages,
            locks = report.released_locks,
            resumed = report.resumed_campaigns,
            leased = report.leased_campaigns,
            held = report.held_campaigns,
            rearmed = report.rearmed_campaigns,
            "Restart recovery complete"
        );
        Ok(report)
    }

    fn lease_ttl(&self) -> Duration {
        let ttl = self.dispatcher.context().lease_ttl();
        Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(60))
    }

    /// Whether another instance holds the campaign's run lease
    async fn leased_elsewhere(&self, campaign: &Campaign) -> Result<bool> {
        let ctx = self.dispatcher.context();
        let holder = ctx.stores.locks.holder(&campaign_lock(campaign.id)).await?;
        Ok(holder.is_some_and(|owner| owner != ctx.instance_id))
    }

    /// Start a run for a QUEUED/RUNNING campaign that has none in this process
    async fn ensure_run(&self, campaign: &Campaign) -> Result<()> {
        if self.dispatcher.is_active(campaign.id) || self.leased_elsewhere(campaign).await? {
            return Ok(());
        }
        if campaign.run == 0 {
            let ctx = self.dispatcher.context();
            begin_run(ctx, campaign, ctx.clock.now()).await?;
        }
        self.dispatcher.start(campaign.id);
        Ok(())
    }

    /// Move a COMPLETED recurring campaign back to SCHEDULED for its next
    /// occurrence
    async fn rearm(&self, campaign: &Campaign) -> Result<bool> {
        let ctx = self.dispatcher.context();
        let now = ctx.clock.now();
        let Some(next) = next_occurrence(campaign, now) else {
            return Ok(false);
        };
        let change = StateChange::new(
            &[CampaignState::Completed],
            CampaignState::Scheduled,
            TransitionReason::Rescheduled,
            now,
        )
        .with_scheduled_at(next);
        let rearmed = ctx.stores.campaigns.transition(campaign.id, change).await?.is_some();
        if rearmed {
            info!(campaign_id = %campaign.id, next = %next, "Recurring campaign re-armed");
        }
        Ok(rearmed)
    }

    /// One supervision pass
    pub async fn tick(&mut self) -> Result<()> {
        let ctx = self.dispatcher.context();
        ctx.heartbeat().await?;
        let expired_before = ctx.clock.now() - self.lease_ttl();
        let released = ctx.stores.locks.release_expired(expired_before).await?;
        if released > 0 {
            warn!(released, "Released dispatch locks of dead instances");
        }

        self.collect_events();

        for (campaign_id, exit) in self.dispatcher.reap().await {
            debug!(campaign_id = %campaign_id, exit = ?exit, "Reaped campaign run");
            if exit == RunExit::Completed {
                if let Some(campaign) = self.dispatcher.context().stores.campaigns.get(campaign_id).await? {
                    self.rearm(&campaign).await?;
                }
            }
        }

        self.start_due().await?;
        self.restart_orphaned().await?;
        self.lift_pauses().await?;
        self.recovered.clear();
        Ok(())
    }

    fn collect_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) if event.recovered() => {
                    self.recovered.insert(event.profile_id);
                }
                Ok(_) => {}
                Err(TryRecvError::Lagged(missed)) => {
                    debug!(missed, "Supervisor lagged on profile events");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    /// SCHEDULED campaigns whose start time has come
    async fn start_due(&self) -> Result<()> {
        let ctx = self.dispatcher.context();
        let now = ctx.clock.now();
        let scheduled = ctx
            .stores
            .campaigns
            .list_by_states(&[CampaignState::Scheduled])
            .await?;

        for campaign in scheduled {
            if campaign.scheduled_at.is_some_and(|at| at > now) {
                continue;
            }
            let change = StateChange::new(
                &[CampaignState::Scheduled],
                CampaignState::Queued,
                TransitionReason::ScheduledStart,
                now,
            );
            let Some(campaign) = ctx.stores.campaigns.transition(campaign.id, change).await? else {
                continue;
            };
            info!(campaign_id = %campaign.id, "Scheduled campaign started");
            begin_run(ctx, &campaign, now).await?;
            self.dispatcher.start(campaign.id);
        }
        Ok(())
    }

    /// QUEUED/RUNNING campaigns without a run, e.g. after an interrupted
    /// run or a resume that raced a draining run
    async fn restart_orphaned(&self) -> Result<()> {
        let active = self
            .dispatcher
            .context()
            .stores
            .campaigns
            .list_by_states(&[CampaignState::Queued, CampaignState::Running])
            .await?;
        for campaign in active {
            if !self.dispatcher.is_active(campaign.id) {
                debug!(campaign_id = %campaign.id, "Restarting campaign run");
                self.ensure_run(&campaign).await?;
            }
        }
        Ok(())
    }

    /// Resume campaigns paused for a condition that has cleared
    async fn lift_pauses(&self) -> Result<()> {
        let ctx = self.dispatcher.context();
        let settings = ctx.settings.borrow().clone();
        let paused = ctx
            .stores
            .campaigns
            .list_by_states(&[CampaignState::Paused])
            .await?;

        for campaign in paused {
            let Some(reason) = campaign.pause_reason else {
                continue;
            };
            if !reason.is_auto_resumable() || !auto_resume_enabled(&campaign, &settings.settings) {
                continue;
            }
            let cleared = match reason {
                PauseReason::ProfilesUnavailable => campaign
                    .profile_ids
                    .iter()
                    .any(|p| !ctx.registry.availability(*p).is_down()),
                PauseReason::CriticalErrors => campaign
                    .profile_ids
                    .iter()
                    .any(|p| self.recovered.contains(p)),
                PauseReason::Manual => false,
            };
            if !cleared || self.dispatcher.is_active(campaign.id) {
                continue;
            }

            let change = StateChange::new(
                &[CampaignState::Paused],
                CampaignState::Queued,
                TransitionReason::AutoResumed,
                ctx.clock.now(),
            )
            .with_detail(reason.to_string());
            if let Some(campaign) = ctx.stores.campaigns.transition(campaign.id, change).await? {
                info!(campaign_id = %campaign.id, reason = %reason, "Campaign auto-resumed");
                resume_run(&self.dispatcher, &campaign).await?;
            }
        }
        Ok(())
    }

    /// Archive messages of campaigns finished longer ago than the retention
    /// period
    pub async fn sweep_retention(&self) -> Result<u64> {
        let ctx = self.dispatcher.context();
        let days = ctx.settings.borrow().settings.campaign_retention_days;
        let before = ctx.clock.now() - Duration::days(i64::from(days));

        let mut archived = 0;
        for campaign_id in ctx.stores.campaigns.list_finished_before(before).await? {
            let count = ctx.stores.messages.archive_campaign(campaign_id).await?;
            if count > 0 {
                debug!(campaign_id = %campaign_id, count, "Archived campaign messages");
            }
            archived += count;
        }
        if archived > 0 {
            info!(archived, retention_days = days, "Retention sweep archived messages");
        }
        Ok(archived)
    }

    /// Run the supervisor until cancelled
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        let config = self.dispatcher.context().config.clone();
        tokio::spawn(async move {
            let mut ticker = interval(std::time::Duration::from_secs(config.poll_interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sweeper =
                interval(std::time::Duration::from_secs(config.retention_sweep_secs.max(1)));
            sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Campaign supervisor started (interval: {}s, retention sweep: {}s)",
                config.poll_interval_secs, config.retention_sweep_secs
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            error!("Supervisor tick failed: {}", e);
                        }
                    }
                    _ = sweeper.tick() => {
                        if let Err(e) = self.sweep_retention().await {
                            error!("Retention sweep failed: {}", e);
                        }
                    }
                }
            }
            info!("Campaign supervisor stopped");
        })
    }
}
