//! Dispatch scheduler
//!
//! Every active campaign is driven by its own task (a campaign run). Runs
//! share the pacing governor, the profile registry and the dispatch locks,
//! which together keep a profile to one in-flight send system-wide.

mod context;
mod plan;
mod run;
mod selector;
mod send;

pub use context::{campaign_lock, client_lock, profile_lock, EngineContext};
pub use run::{execute, RunExit};
pub use selector::order_profiles;

use crate::settings::ConfigError;
use chrono::{DateTime, Utc};
use courier_common::types::{CampaignId, MessageId, TemplateId};
use courier_storage::{CampaignCounters, Stores};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Control signal sent to a running campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Continue,
    /// The campaign was paused; finish in-flight sends and stop
    Pause,
    /// The campaign was cancelled; finish in-flight sends, skip the rest
    Cancel,
    /// Process shutdown; finish in-flight sends and leave the state as is
    Shutdown,
}

/// Run-level faults
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Message {message_id} was claimed concurrently")]
    RaceCondition { message_id: MessageId },

    #[error("Template {0} not found")]
    TemplateMissing(TemplateId),

    #[error("Template {0} has no items")]
    EmptyTemplate(TemplateId),

    #[error("Send task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] courier_common::Error),
}

impl DispatchError {
    /// Whether the run can simply be started again later
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::Storage(e) => e.is_transient(),
            DispatchError::Task(_) => true,
            _ => false,
        }
    }
}

/// Mark every PENDING message of a run SKIPPED
pub async fn skip_pending(
    stores: &Stores,
    campaign_id: CampaignId,
    run: i32,
    reason: &str,
    at: DateTime<Utc>,
) -> courier_common::Result<u64> {
    let pending = stores.messages.pending_for_run(campaign_id, run).await?;
    let mut skipped = 0;
    for message in pending {
        if stores
            .messages
            .skip(message.id, reason.to_string(), at)
            .await?
        {
            skipped += 1;
        }
    }
    Ok(skipped)
}

/// Recompute a run's counters from its messages and store them
pub async fn refresh_counters(
    stores: &Stores,
    campaign_id: CampaignId,
    run: i32,
) -> courier_common::Result<CampaignCounters> {
    let counters = stores.messages.counts(campaign_id, run).await?.counters();
    stores.campaigns.set_counters(campaign_id, counters).await?;
    Ok(counters)
}

struct RunHandle {
    control: watch::Sender<RunSignal>,
    task: JoinHandle<RunExit>,
}

/// Owner of all campaign run tasks in this process
pub struct Dispatcher {
    ctx: Arc<EngineContext>,
    runs: Mutex<HashMap<CampaignId, RunHandle>>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<CampaignId, RunHandle>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a run task unless one is already active
    pub fn start(&self, campaign_id: CampaignId) -> bool {
        let mut runs = self.runs();
        if runs
            .get(&campaign_id)
            .is_some_and(|handle| !handle.task.is_finished())
        {
            return false;
        }

        let (control, rx) = watch::channel(RunSignal::Continue);
        let task = tokio::spawn(execute(self.ctx.clone(), campaign_id, rx));
        runs.insert(campaign_id, RunHandle { control, task });
        info!(campaign_id = %campaign_id, "Campaign run started");
        true
    }

    /// Signal an active run; `false` if none is active
    pub fn signal(&self, campaign_id: CampaignId, signal: RunSignal) -> bool {
        match self.runs().get(&campaign_id) {
            Some(handle) if !handle.task.is_finished() => handle.control.send(signal).is_ok(),
            _ => false,
        }
    }

    pub fn is_active(&self, campaign_id: CampaignId) -> bool {
        self.runs()
            .get(&campaign_id)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Collect the exits of finished runs
    pub async fn reap(&self) -> Vec<(CampaignId, RunExit)> {
        let finished: Vec<(CampaignId, RunHandle)> = {
            let mut runs = self.runs();
            let ids: Vec<CampaignId> = runs
                .iter()
                .filter(|(_, handle)| handle.task.is_finished())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| runs.remove(&id).map(|handle| (id, handle)))
                .collect()
        };

        let mut exits = Vec::with_capacity(finished.len());
        for (id, handle) in finished {
            match handle.task.await {
                Ok(exit) => exits.push((id, exit)),
                Err(e) => {
                    warn!(campaign_id = %id, "Campaign run task failed: {}", e);
                    exits.push((id, RunExit::Interrupted));
                }
            }
        }
        exits
    }

    /// Ask every run to stop after its in-flight sends and wait for them
    pub async fn shutdown(&self) {
        let handles: Vec<(CampaignId, RunHandle)> = self.runs().drain().collect();
        for (_, handle) in &handles {
            let _ = handle.control.send(RunSignal::Shutdown);
        }
        for (id, handle) in handles {
            if let Err(e) = handle.task.await {
                warn!(campaign_id = %id, "Campaign run task failed: {}", e);
            }
        }
        info!("All campaign runs stopped");
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::Clock;
    use crate::executor::{CriticalCause, SendOutcome, SendResult};
    use crate::notify::Notification;
    use super::RunSignal;
    use crate::testing::{fast_settings, Fixture, TestEngine};
    use chrono::Duration as ChronoDuration;
    use courier_common::types::{DedupOptions, PauseMode, ScheduleConfig};
    use courier_common::GlobalSettings;
    use courier_storage::{
        CampaignState, MessageRepository, MessageStatus, NewMessage, PauseReason,
    };
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::time::Duration;
    use uuid::Uuid;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_one_send_per_profile() {
        let mut engine = TestEngine::new(2, 10);
        let campaign = engine.draft().await;
        let active = engine.manager.activate(campaign.id).await.unwrap();
        assert_eq!(active.run, 1);
        assert_eq!(active.total_recipients, 10);

        let done = engine
            .wait_for(campaign.id, MINUTE, |c| c.state == CampaignState::Completed)
            .await;
        assert_eq!(done.counters.sent, 10);
        assert_eq!(done.counters.remaining, 0);
        assert_eq!(engine.executor.overlaps(), 0);

        let requests = engine.executor.requests();
        assert_eq!(requests.len(), 10);
        let contacts: HashSet<_> = requests.iter().map(|r| r.contact.clone()).collect();
        assert_eq!(contacts.len(), 10);
        let used: HashSet<_> = requests.iter().map(|r| r.profile_id).collect();
        assert_eq!(used.len(), 2);

        let client = engine.memory.client(engine.clients[0].id).unwrap();
        assert_eq!(client.campaign_count, 1);
        assert!(client.last_campaign_at.is_some());

        let notifications = engine.drain_notifications();
        for percent in [50, 75, 90] {
            assert!(notifications
                .iter()
                .any(|n| matches!(n, Notification::Progress { percent: p, .. } if *p == percent)));
        }
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::CampaignCompleted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_on_one_profile_are_spaced() {
        let engine = TestEngine::new(1, 4);
        let campaign = engine.draft().await;
        engine.manager.activate(campaign.id).await.unwrap();
        engine
            .wait_for(campaign.id, MINUTE, |c| c.state == CampaignState::Completed)
            .await;

        let mut sent_at: Vec<_> = engine
            .memory
            .messages_of(campaign.id)
            .into_iter()
            .filter_map(|m| m.sent_at)
            .collect();
        sent_at.sort();
        assert_eq!(sent_at.len(), 4);
        // 50ms send latency plus at least 100ms contact delay
        for pair in sent_at.windows(2) {
            assert!(pair[1] - pair[0] >= ChronoDuration::milliseconds(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let engine = TestEngine::new(1, 3);
        let flaky = engine.clients[1].phone.clone();
        engine.executor.script(
            &flaky,
            vec![SendResult::failed(SendOutcome::TransientFailure, "timeout")],
        );

        let campaign = engine.draft().await;
        engine.manager.activate(campaign.id).await.unwrap();
        let done = engine
            .wait_for(campaign.id, MINUTE, |c| c.state == CampaignState::Completed)
            .await;
        assert_eq!(done.counters.sent, 3);
        assert_eq!(engine.executor.requests_to(&flaky), 2);

        let message = engine
            .memory
            .messages_of(campaign.id)
            .into_iter()
            .find(|m| m.phone == flaky)
            .unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_final() {
        let engine = TestEngine::new(1, 2);
        let rejected = engine.clients[0].phone.clone();
        engine.executor.script(
            &rejected,
            vec![SendResult::failed(SendOutcome::PermanentFailure, "invalid number")],
        );

        let campaign = engine.draft().await;
        engine.manager.activate(campaign.id).await.unwrap();
        let done = engine
            .wait_for(campaign.id, MINUTE, |c| c.state == CampaignState::Completed)
            .await;
        assert_eq!(done.counters.sent, 1);
        assert_eq!(done.counters.failed, 1);
        assert_eq!(engine.executor.requests_to(&rejected), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_errors_pause_campaign() {
        let mut engine = TestEngine::new(1, 4);
        engine.executor.set_fallback(Some(SendResult::failed(
            SendOutcome::CriticalFailure(CriticalCause::Blocked),
            "account restricted",
        )));

        let campaign = engine.draft().await;
        engine.manager.activate(campaign.id).await.unwrap();
        let paused = engine
            .wait_for(campaign.id, MINUTE, |c| c.state == CampaignState::Paused)
            .await;
        assert_eq!(paused.pause_reason, Some(PauseReason::CriticalErrors));
        engine.wait_idle(campaign.id).await;

        // Three consecutive critical errors suspend the only profile
        assert_eq!(engine.executor.requests().len(), 3);
        let messages = engine.memory.messages_of(campaign.id);
        assert!(messages.iter().all(|m| m.status == MessageStatus::Pending));
        assert!(engine
            .drain_notifications()
            .iter()
            .any(|n| matches!(n, Notification::CampaignError { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_profiles_pause_campaign() {
        let engine = TestEngine::new(2, 3);
        for profile in &engine.profiles {
            engine
                .registry
                .update(*profile, courier_common::types::Availability::Stopped);
        }

        let campaign = engine.draft().await;
        engine.manager.activate(campaign.id).await.unwrap();
        let paused = engine
            .wait_for(campaign.id, MINUTE, |c| c.state == CampaignState::Paused)
            .await;
        assert_eq!(paused.pause_reason, Some(PauseReason::ProfilesUnavailable));
        assert!(engine.executor.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_window_defers_dispatch() {
        let engine = TestEngine::new(1, 2);
        let mut input = engine.new_campaign();
        input.schedule = ScheduleConfig {
            work_hours_enabled: true,
            work_hours_start: Some("12:00".to_string()),
            work_hours_end: Some("18:00".to_string()),
            timezone: Some("UTC".to_string()),
            ..Default::default()
        };
        let campaign = engine.manager.create(input).await.unwrap();
        engine.manager.activate(campaign.id).await.unwrap();

        tokio::time::sleep(MINUTE).await;
        let waiting = engine.manager.status(campaign.id).await.unwrap();
        assert_eq!(waiting.state, CampaignState::Queued);
        assert!(engine.executor.requests().is_empty());

        engine
            .wait_for(campaign.id, 3 * 60 * MINUTE, |c| {
                c.state == CampaignState::Completed
            })
            .await;
        let opens = crate::testing::base_time() + ChronoDuration::hours(2);
        for message in engine.memory.messages_of(campaign.id) {
            assert!(message.sent_at.is_some_and(|at| at >= opens));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_excludes_recent_recipient() {
        let engine = TestEngine::new(1, 3);
        let earlier = Uuid::new_v4();
        let now = engine.clock.now();

        let old = engine
            .stores
            .messages
            .create(
                NewMessage {
                    campaign_id: earlier,
                    run: 1,
                    client_id: engine.clients[0].id,
                    channel: courier_common::types::Channel::Whatsapp,
                    phone: engine.clients[0].phone.clone(),
                    step: 0,
                },
                now - ChronoDuration::days(1),
            )
            .await
            .unwrap()
            .unwrap();
        let past = now - ChronoDuration::days(1);
        engine.memory.claim(old.id, Uuid::new_v4(), "courier-test", past).await.unwrap();
        engine
            .memory
            .complete(old.id, MessageStatus::Sent, None, past)
            .await
            .unwrap();

        let mut input = engine.new_campaign();
        input.options.deduplication = Some(DedupOptions {
            enabled: true,
            period_days: 7,
            campaign_ids: vec![earlier],
        });
        let campaign = engine.manager.create(input).await.unwrap();
        engine.manager.activate(campaign.id).await.unwrap();

        let done = engine
            .wait_for(campaign.id, MINUTE, |c| c.state == CampaignState::Completed)
            .await;
        assert_eq!(done.counters.sent, 2);
        assert_eq!(engine.executor.requests_to(&engine.clients[0].phone), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_send_each_client_once() {
        let engine = TestEngine::new(1, 8);
        let campaign = engine.draft().await;
        engine.manager.activate(campaign.id).await.unwrap();

        engine
            .wait_for(campaign.id, MINUTE, |c| c.counters.sent >= 2)
            .await;
        let paused = engine.manager.pause(campaign.id).await.unwrap();
        assert_eq!(paused.pause_reason, Some(PauseReason::Manual));
        engine.wait_idle(campaign.id).await;

        let sent_while_paused = engine.executor.requests().len();
        tokio::time::sleep(MINUTE).await;
        assert_eq!(engine.executor.requests().len(), sent_while_paused);

        engine.manager.resume(campaign.id).await.unwrap();
        let done = engine
            .wait_for(campaign.id, MINUTE, |c| c.state == CampaignState::Completed)
            .await;
        assert_eq!(done.counters.sent, 8);

        let requests = engine.executor.requests();
        let contacts: HashSet<_> = requests.iter().map(|r| r.contact.clone()).collect();
        assert_eq!(requests.len(), 8);
        assert_eq!(contacts.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_skips_pending_messages() {
        let engine = TestEngine::new(1, 10);
        let campaign = engine.draft().await;
        engine.manager.activate(campaign.id).await.unwrap();
        engine
            .wait_for(campaign.id, MINUTE, |c| c.counters.sent >= 1)
            .await;

        let cancelled = engine.manager.cancel(campaign.id).await.unwrap();
        assert_eq!(cancelled.state, CampaignState::Cancelled);
        engine.wait_idle(campaign.id).await;

        let messages = engine.memory.messages_of(campaign.id);
        assert!(messages
            .iter()
            .all(|m| matches!(m.status, MessageStatus::Sent | MessageStatus::Skipped)));
        assert!(messages.iter().any(|m| m.status == MessageStatus::Skipped));

        let status = engine.manager.status(campaign.id).await.unwrap();
        assert_eq!(status.state, CampaignState::Cancelled);
        assert_eq!(status.counters.remaining, 0);
        assert!(engine.executor.requests().len() < 10);

        let err = engine.manager.resume(campaign.id).await.unwrap_err();
        assert!(matches!(
            err,
            crate::campaign::CampaignError::InvalidTransition { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_rejects_missing_template() {
        let engine = TestEngine::new(1, 2);
        let mut input = engine.new_campaign();
        input.template_id = Uuid::new_v4();
        let campaign = engine.manager.create(input).await.unwrap();

        assert!(engine.manager.activate(campaign.id).await.is_err());
        assert_eq!(
            engine.manager.status(campaign.id).await.unwrap().state,
            CampaignState::Draft
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_pass_starts_no_further_sends() {
        let engine = TestEngine::new(4, 8);
        let campaign = engine.draft().await;

        // Cancel as soon as the first profile is taken, before the pass ends
        let dispatcher = engine.dispatcher.clone();
        let id = campaign.id;
        engine.lock_hook.arm("profile:", move |_| {
            dispatcher.signal(id, RunSignal::Cancel);
        });
        engine.manager.activate(campaign.id).await.unwrap();
        engine.wait_idle(campaign.id).await;

        assert_eq!(engine.executor.requests().len(), 1);
        let messages = engine.memory.messages_of(campaign.id);
        assert_eq!(
            messages.iter().filter(|m| m.status == MessageStatus::Sent).count(),
            1
        );
        assert!(messages
            .iter()
            .all(|m| matches!(m.status, MessageStatus::Sent | MessageStatus::Skipped)));

        let cancelled = engine.manager.cancel(campaign.id).await.unwrap();
        assert_eq!(cancelled.state, CampaignState::Cancelled);
        tokio::time::sleep(MINUTE).await;
        assert_eq!(engine.executor.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_between_clients_never_overlaps_one_client() {
        let engine = TestEngine::build(Fixture {
            profiles: 4,
            clients: 6,
            template_items: 2,
            latency: Duration::from_millis(300),
            settings: GlobalSettings {
                pause_mode: PauseMode::BetweenClients,
                ..fast_settings()
            },
            ..Fixture::default()
        });

        // Same recipients, disjoint profiles
        let mut first = engine.new_campaign();
        first.profile_ids = engine.profiles[..2].to_vec();
        let mut second = engine.new_campaign();
        second.profile_ids = engine.profiles[2..].to_vec();
        let first = engine.manager.create(first).await.unwrap();
        let second = engine.manager.create(second).await.unwrap();
        engine.manager.activate(first.id).await.unwrap();
        engine.manager.activate(second.id).await.unwrap();

        for id in [first.id, second.id] {
            let done = engine
                .wait_for(id, MINUTE, |c| c.state == CampaignState::Completed)
                .await;
            assert_eq!(done.counters.sent, 6);
        }
        assert_eq!(engine.executor.contact_overlaps(), 0);
        assert_eq!(engine.executor.overlaps(), 0);
        for client in &engine.clients {
            assert_eq!(engine.executor.requests_to(&client.phone), 4);
        }
    }
}
