//! Campaign run task
//!
//! A run gates on the work window, admits candidates a little ahead of
//! capacity, assigns each ready client step to a free profile and settles
//! send reports as they arrive. In-flight sends are never aborted: every
//! stop (pause, cancel, shutdown, completion, failure) drains them first.

use super::context::{campaign_lock, client_lock, profile_lock, EngineContext};
use super::plan::{group_pending, ClientPlan, StepResult};
use super::selector::RoundRobin;
use super::send::{self, SendJob, SendReport};
use super::{refresh_counters, skip_pending, DispatchError, RunSignal};
use crate::clock::until;
use crate::eligibility::CandidateStream;
use crate::executor::{CriticalCause, SendOutcome};
use crate::health::ProfileEvent;
use crate::notify::Notification;
use crate::pacing::{Acquire, PacingLimits, Permit};
use crate::retry::{CriticalAction, ErrorTracker, RetryDecision};
use crate::settings::{EffectivePolicy, SettingsWatch};
use crate::window::GateDecision;
use chrono::{DateTime, Duration, Utc};
use courier_common::types::{CampaignId, ClientId, PauseMode, ProfileId};
use courier_storage::{
    Campaign, CampaignState, Message, MessageStatus, NewMessage, PauseReason, SentQuery,
    StateChange, TemplateItem, TransitionReason,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const PROGRESS_THRESHOLDS: [u8; 3] = [50, 75, 90];
const ACTIVE: [CampaignState; 2] = [CampaignState::Queued, CampaignState::Running];

/// How a run task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Candidates exhausted or recurrence ended
    Completed,
    Paused(PauseReason),
    Cancelled,
    /// Campaign moved to ERROR
    Failed,
    /// Transient fault; the campaign keeps its state and can be restarted
    Interrupted,
    /// Process shutdown; the campaign keeps its state
    Shutdown,
    /// The campaign was not in a runnable state
    Stopped,
    /// Another engine instance holds the campaign's run lease
    Leased,
}

/// Why the dispatch loop stopped
#[derive(Debug)]
enum Stop {
    /// External control signal; the state was already changed by the caller
    Signalled(RunSignal),
    Pause(PauseReason),
    Complete(TransitionReason),
    Fail(DispatchError),
    /// The campaign left QUEUED/RUNNING for another reason
    Vanished,
}

/// Outcome of trying to start one client step
enum Dispatch {
    Started,
    /// The client's remaining steps were skipped
    Skipped,
    /// This client is blocked until the given instant
    Blocked(DateTime<Utc>),
    /// No profile can take a send now
    NoProfile(Option<DateTime<Utc>>),
}

/// Drive one campaign run to its end
pub async fn execute(
    ctx: Arc<EngineContext>,
    campaign_id: CampaignId,
    control: watch::Receiver<RunSignal>,
) -> RunExit {
    let lease = campaign_lock(campaign_id);
    match acquire_lease(&ctx, &lease).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(campaign_id = %campaign_id, "Campaign is run by another instance");
            return RunExit::Leased;
        }
        Err(e) => {
            warn!(campaign_id = %campaign_id, "Failed to acquire run lease: {}", e);
            return RunExit::Interrupted;
        }
    }

    ctx.metrics.run_started();
    let exit = match CampaignRun::prepare(ctx.clone(), campaign_id, control).await {
        Ok(Some(mut run)) => run.drive().await,
        Ok(None) => RunExit::Stopped,
        Err(e) => fail_campaign(&ctx, campaign_id, e).await,
    };
    ctx.metrics.run_stopped();

    if let Err(e) = ctx.stores.locks.release(&lease, &ctx.instance_id).await {
        warn!(campaign_id = %campaign_id, "Failed to release run lease: {}", e);
    }
    info!(campaign_id = %campaign_id, exit = ?exit, "Campaign run finished");
    exit
}

/// Take the run lease; a lease already held by this instance counts
async fn acquire_lease(ctx: &EngineContext, key: &str) -> courier_common::Result<bool> {
    let now = ctx.clock.now();
    if ctx.stores.locks.try_acquire(key, &ctx.instance_id, now).await? {
        return Ok(true);
    }
    let holder = ctx.stores.locks.holder(key).await?;
    Ok(holder.as_deref() == Some(ctx.instance_id.as_str()))
}

/// Move a campaign to ERROR after a fatal fault, or leave it for a later
/// restart when the fault is transient
async fn fail_campaign(ctx: &EngineContext, campaign_id: CampaignId, err: DispatchError) -> RunExit {
    if err.is_transient() {
        warn!(campaign_id = %campaign_id, "Campaign run interrupted: {}", err);
        return RunExit::Interrupted;
    }

    error!(campaign_id = %campaign_id, "Campaign run failed: {}", err);
    let reason = match err {
        DispatchError::RaceCondition { .. } => TransitionReason::RaceCondition,
        _ => TransitionReason::Fatal,
    };
    let now = ctx.clock.now();
    let change = StateChange::new(&ACTIVE, CampaignState::Error, reason, now)
        .with_detail(err.to_string());

    match ctx.stores.campaigns.transition(campaign_id, change).await {
        Ok(Some(campaign)) => {
            if let Err(e) =
                skip_pending(&ctx.stores, campaign_id, campaign.run, "campaign error", now).await
            {
                error!(campaign_id = %campaign_id, "Failed to skip pending messages: {}", e);
            }
            if let Err(e) = refresh_counters(&ctx.stores, campaign_id, campaign.run).await {
                error!(campaign_id = %campaign_id, "Failed to refresh counters: {}", e);
            }
            ctx.notifier.notify(Notification::CampaignError {
                campaign_id,
                name: campaign.name,
                reason: err.to_string(),
            });
            RunExit::Failed
        }
        Ok(None) => RunExit::Stopped,
        Err(e) => {
            error!(campaign_id = %campaign_id, "Failed to record campaign error: {}", e);
            RunExit::Interrupted
        }
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

struct CampaignRun {
    ctx: Arc<EngineContext>,
    campaign: Campaign,
    policy: EffectivePolicy,
    items: Arc<Vec<TemplateItem>>,
    plans: Vec<ClientPlan>,
    stream: CandidateStream,
    stream_done: bool,
    tracker: ErrorTracker,
    selector: RoundRobin,
    first_used: HashMap<ProfileId, DateTime<Utc>>,
    in_flight: JoinSet<SendReport>,
    busy_profiles: HashSet<ProfileId>,
    control: watch::Receiver<RunSignal>,
    settings: SettingsWatch,
    settings_open: bool,
    events: broadcast::Receiver<ProfileEvent>,
    events_open: bool,
    rng: StdRng,
    progress_notified: u8,
    stop: Option<Stop>,
}

impl CampaignRun {
    async fn prepare(
        ctx: Arc<EngineContext>,
        campaign_id: CampaignId,
        control: watch::Receiver<RunSignal>,
    ) -> Result<Option<Self>, DispatchError> {
        let stores = &ctx.stores;
        let Some(campaign) = stores.campaigns.get(campaign_id).await? else {
            warn!(campaign_id = %campaign_id, "Campaign not found");
            return Ok(None);
        };
        if !ACTIVE.contains(&campaign.state) {
            debug!(campaign_id = %campaign_id, state = %campaign.state, "Campaign is not runnable");
            return Ok(None);
        }

        let mut settings = ctx.settings.clone();
        let snapshot = settings.borrow_and_update().clone();
        let limits = stores.settings.user_limits(campaign.owner_id).await?;
        let policy = EffectivePolicy::resolve(&snapshot, limits.as_ref(), &campaign)?;

        let template = stores
            .templates
            .get(campaign.template_id)
            .await?
            .ok_or(DispatchError::TemplateMissing(campaign.template_id))?;
        if template.items.is_empty() {
            return Err(DispatchError::EmptyTemplate(template.id));
        }

        let now = ctx.clock.now();
        let mut first_used = HashMap::new();
        for profile_id in &campaign.profile_ids {
            if !ctx.governor.is_seeded(*profile_id) {
                let history = stores
                    .messages
                    .sent_times_since(*profile_id, now - Duration::days(1))
                    .await?;
                ctx.governor.seed(*profile_id, &history, now);
            }
            if let Some(first) = stores
                .profiles
                .get(*profile_id)
                .await?
                .and_then(|state| state.first_used_at)
            {
                first_used.insert(*profile_id, first);
            }
        }

        let plans = group_pending(stores.messages.pending_for_run(campaign.id, campaign.run).await?);
        let stream = CandidateStream::new(&campaign, &policy, ctx.config.candidate_batch_size);
        let tracker = ErrorTracker::new(policy.critical, campaign.profile_ids.clone());
        let percent = campaign.progress_percentage();
        let progress_notified = PROGRESS_THRESHOLDS
            .iter()
            .copied()
            .filter(|t| percent >= f64::from(*t))
            .max()
            .unwrap_or(0);

        info!(
            campaign_id = %campaign.id,
            run = campaign.run,
            resumed_steps = plans.iter().map(|p| p.steps.len()).sum::<usize>(),
            "Campaign run prepared"
        );

        let events = ctx.registry.subscribe();
        Ok(Some(Self {
            ctx,
            campaign,
            policy,
            items: Arc::new(template.items),
            plans,
            stream,
            stream_done: false,
            tracker,
            selector: RoundRobin::default(),
            first_used,
            in_flight: JoinSet::new(),
            busy_profiles: HashSet::new(),
            control,
            settings,
            settings_open: true,
            events,
            events_open: true,
            rng: StdRng::from_entropy(),
            progress_notified,
            stop: None,
        }))
    }

    async fn drive(&mut self) -> RunExit {
        let stop = match self.dispatch_loop().await {
            Ok(stop) => stop,
            Err(e) => Stop::Fail(e),
        };
        self.drain().await;
        self.finish(stop).await
    }

    async fn dispatch_loop(&mut self) -> Result<Stop, DispatchError> {
        loop {
            if let Some(stop) = self.stop.take() {
                return Ok(stop);
            }
            let signal = *self.control.borrow();
            if signal != RunSignal::Continue {
                return Ok(Stop::Signalled(signal));
            }

            let now = self.ctx.clock.now();
            match self.policy.window.check(now) {
                GateDecision::Closed => {
                    return Ok(Stop::Complete(TransitionReason::RecurrenceEnded));
                }
                GateDecision::Wait { until } => {
                    if !self.enter(CampaignState::Queued, TransitionReason::WindowClosed).await? {
                        return Ok(self.stop_from_state());
                    }
                    debug!(campaign_id = %self.campaign.id, until = %until, "Waiting for work window");
                    self.wait(Some(until)).await?;
                    continue;
                }
                GateDecision::Allow => {
                    if !self.enter(CampaignState::Running, TransitionReason::WindowOpened).await? {
                        return Ok(self.stop_from_state());
                    }
                }
            }

            self.admit(now).await?;
            if self.stream_done && self.plans.is_empty() && self.in_flight.is_empty() {
                return Ok(Stop::Complete(TransitionReason::CandidatesExhausted));
            }

            let wake = match self.unusable_profiles() {
                Some(reason) if self.in_flight.is_empty() => return Ok(Stop::Pause(reason)),
                Some(_) => None,
                None => self.dispatch_ready(now).await?,
            };
            self.wait(wake).await?;
        }
    }

    /// Move between QUEUED and RUNNING; `false` if the campaign left both
    async fn enter(
        &mut self,
        state: CampaignState,
        reason: TransitionReason,
    ) -> Result<bool, DispatchError> {
        if self.campaign.state == state {
            return Ok(true);
        }
        let from = match state {
            CampaignState::Running => CampaignState::Queued,
            _ => CampaignState::Running,
        };
        let change = StateChange::new(&[from], state, reason, self.ctx.clock.now());
        self.apply(change).await
    }

    /// Compare-and-set a state change; reloads the campaign when it fails
    async fn apply(&mut self, change: StateChange) -> Result<bool, DispatchError> {
        let reason = change.reason;
        let stores = &self.ctx.stores;
        match stores.campaigns.transition(self.campaign.id, change).await? {
            Some(campaign) => {
                info!(
                    campaign_id = %campaign.id,
                    state = %campaign.state,
                    reason = %reason,
                    "Campaign state changed"
                );
                self.campaign = campaign;
                Ok(true)
            }
            None => {
                if let Some(campaign) = stores.campaigns.get(self.campaign.id).await? {
                    self.campaign = campaign;
                }
                Ok(false)
            }
        }
    }

    fn stop_from_state(&self) -> Stop {
        match self.campaign.state {
            CampaignState::Paused => Stop::Signalled(RunSignal::Pause),
            CampaignState::Cancelled => Stop::Signalled(RunSignal::Cancel),
            _ => Stop::Vanished,
        }
    }

    /// Pull candidates until a small lookahead of clients is planned
    async fn admit(&mut self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        let lookahead = (self.campaign.profile_ids.len() * 2).max(4);
        while !self.stream_done && self.plans.len() < lookahead {
            let Some(candidate) = self.stream.next(&self.ctx.stores, now).await? else {
                self.stream_done = true;
                debug!(
                    campaign_id = %self.campaign.id,
                    admitted = self.stream.admitted_count(),
                    "Candidates exhausted"
                );
                break;
            };

            let mut steps = Vec::with_capacity(candidate.steps.len());
            for (index, step) in candidate.steps.into_iter().enumerate() {
                let input = NewMessage {
                    campaign_id: self.campaign.id,
                    run: self.campaign.run,
                    client_id: candidate.client.id,
                    channel: step.channel,
                    phone: step.phone,
                    step: index as i16,
                };
                if let Some(message) = self.ctx.stores.messages.create(input, now).await? {
                    steps.push(message);
                }
            }
            if !steps.is_empty() {
                self.plans.push(ClientPlan::new(candidate.client.id, steps));
            }
        }
        Ok(())
    }

    /// Pause reason when no assigned profile can send at all
    fn unusable_profiles(&self) -> Option<PauseReason> {
        let profiles = &self.campaign.profile_ids;
        let down = profiles
            .iter()
            .filter(|p| self.ctx.registry.availability(**p).is_down())
            .count();
        let suspended = profiles
            .iter()
            .filter(|p| !self.ctx.registry.availability(**p).is_down())
            .filter(|p| self.tracker.is_suspended(**p))
            .count();

        if down + suspended < profiles.len() {
            None
        } else if down > 0 {
            Some(PauseReason::ProfilesUnavailable)
        } else {
            Some(PauseReason::CriticalErrors)
        }
    }

    /// Start every ready client step a free profile can take; returns the
    /// earliest instant something blocked may become ready
    async fn dispatch_ready(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, DispatchError> {
        let mut wake = None;
        for index in 0..self.plans.len() {
            if self.busy_profiles.len() >= self.campaign.profile_ids.len() {
                break;
            }
            // A pause or cancel must not start another send in this pass
            if self.stop.is_some() || *self.control.borrow() != RunSignal::Continue {
                break;
            }
            let plan = &self.plans[index];
            if plan.in_flight || plan.is_done() {
                continue;
            }
            if !plan.is_ready(now) {
                wake = earliest(wake, plan.ready_at());
                continue;
            }

            match self.try_dispatch(index, now).await? {
                Dispatch::Started | Dispatch::Skipped => {}
                Dispatch::Blocked(at) => wake = earliest(wake, Some(at)),
                Dispatch::NoProfile(at) => {
                    wake = earliest(wake, at);
                    break;
                }
            }
        }
        self.plans.retain(|plan| plan.in_flight || !plan.is_done());
        Ok(wake)
    }

    async fn try_dispatch(&mut self, index: usize, now: DateTime<Utc>) -> Result<Dispatch, DispatchError> {
        let client_id = self.plans[index].client_id;
        let Some(head) = self.plans[index].head().cloned() else {
            return Ok(Dispatch::Skipped);
        };

        if head.attempts == 0 {
            if let Some(reason) = self.excluded_since_admission(client_id, now).await? {
                let steps = self.plans[index].take_all();
                self.skip(steps, reason, now).await?;
                return Ok(Dispatch::Skipped);
            }
        }

        let client_key = if self.policy.pause_mode == PauseMode::BetweenClients {
            let key = client_lock(client_id);
            if !self
                .ctx
                .stores
                .locks
                .try_acquire(&key, &self.ctx.instance_id, now)
                .await?
            {
                let retry_at = now + self.lock_retry();
                self.plans[index].blocked_until = Some(retry_at);
                return Ok(Dispatch::Blocked(retry_at));
            }
            Some(key)
        } else {
            None
        };

        let (profile_id, permit) = match self.select_profile(now).await {
            Ok(Ok(selected)) => selected,
            Ok(Err(retry_at)) => {
                self.release_lock(client_key.as_deref()).await;
                return Ok(Dispatch::NoProfile(retry_at));
            }
            Err(e) => {
                self.release_lock(client_key.as_deref()).await;
                return Err(e);
            }
        };

        let claimed = match self
            .ctx
            .stores
            .messages
            .claim(head.id, profile_id, &self.ctx.instance_id, now)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.abandon(profile_id, permit, client_key.as_deref()).await;
                return Err(e.into());
            }
        };
        let Some(message) = claimed else {
            // Taken by another run; whoever holds it finishes the client
            self.abandon(profile_id, permit, client_key.as_deref()).await;
            warn!(
                campaign_id = %self.campaign.id,
                message_id = %head.id,
                client_id = %client_id,
                "Message claimed elsewhere, leaving client to its holder"
            );
            self.plans[index].take_all();
            return Ok(Dispatch::Skipped);
        };

        if !self.first_used.contains_key(&profile_id) {
            self.ctx.stores.profiles.mark_first_used(profile_id, now).await?;
            self.first_used.insert(profile_id, now);
        }

        let gaps = self.items.len().saturating_sub(message.items_sent.max(0) as usize + 1);
        let item_delays = (0..gaps)
            .map(|_| self.policy.message_delay.sample(&mut self.rng))
            .collect();

        let plan = &mut self.plans[index];
        if let Some(front) = plan.steps.front_mut() {
            *front = message.clone();
        }
        plan.in_flight = true;
        plan.blocked_until = None;

        debug!(
            campaign_id = %self.campaign.id,
            message_id = %message.id,
            profile_id = %profile_id,
            channel = %message.channel,
            attempt = message.attempts,
            "Dispatching message"
        );

        self.busy_profiles.insert(profile_id);
        self.selector.advance_past(&self.campaign.profile_ids, profile_id);
        let job = SendJob {
            message,
            profile_id,
            permit,
            items: self.items.clone(),
            typing: self.policy.typing,
            item_delays,
            client_lock: client_key,
        };
        self.in_flight.spawn(send::execute(self.ctx.clone(), job));
        Ok(Dispatch::Started)
    }

    /// Dedup or cooldown hit that appeared after the client was admitted,
    /// e.g. a send by another campaign in the meantime
    async fn excluded_since_admission(
        &self,
        client_id: ClientId,
        now: DateTime<Utc>,
    ) -> Result<Option<&'static str>, DispatchError> {
        let current = Some((self.campaign.id, self.campaign.run));
        if let Some(dedup) = &self.policy.dedup {
            let hits = self
                .ctx
                .stores
                .messages
                .sent_clients(SentQuery {
                    client_ids: vec![client_id],
                    campaign_ids: Some(dedup.campaign_ids.clone()),
                    exclude_run: current,
                    since: now - dedup.period,
                })
                .await?;
            if !hits.is_empty() {
                return Ok(Some("deduplicated"));
            }
        }
        if let Some(cooldown) = self.policy.cooldown {
            let hits = self
                .ctx
                .stores
                .messages
                .sent_clients(SentQuery {
                    client_ids: vec![client_id],
                    campaign_ids: None,
                    exclude_run: current,
                    since: now - cooldown,
                })
                .await?;
            if !hits.is_empty() {
                return Ok(Some("cooldown"));
            }
        }
        Ok(None)
    }

    /// Free profile with pacing capacity and its profile lock, or the
    /// earliest instant one may become free
    async fn select_profile(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Result<(ProfileId, Permit), Option<DateTime<Utc>>>, DispatchError> {
        let governor = self.ctx.governor.clone();
        let order = self
            .selector
            .order(&self.campaign.profile_ids, |p| governor.last_success(p));

        let mut retry_at = None;
        for profile_id in order {
            if self.busy_profiles.contains(&profile_id)
                || self.ctx.registry.availability(profile_id).is_down()
                || self.tracker.is_suspended(profile_id)
            {
                continue;
            }

            let permit = match governor.try_acquire(profile_id, self.limits_for(profile_id, now), now) {
                Acquire::Granted(permit) => permit,
                Acquire::Denied { retry_at: at } => {
                    self.ctx.metrics.pacing_denied();
                    retry_at = earliest(retry_at, Some(at));
                    continue;
                }
            };

            let key = profile_lock(profile_id);
            match self
                .ctx
                .stores
                .locks
                .try_acquire(&key, &self.ctx.instance_id, now)
                .await
            {
                Ok(true) => return Ok(Ok((profile_id, permit))),
                Ok(false) => {
                    governor.release(permit);
                    retry_at = earliest(retry_at, Some(now + self.lock_retry()));
                }
                Err(e) => {
                    governor.release(permit);
                    return Err(e.into());
                }
            }
        }
        Ok(Err(retry_at))
    }

    fn limits_for(&self, profile_id: ProfileId, now: DateTime<Utc>) -> PacingLimits {
        let warm_day = self
            .first_used
            .get(&profile_id)
            .map_or(0, |first| (now - *first).num_days().max(0))
            + 1;
        let since_start = self
            .campaign
            .started_at
            .and_then(|start| (now - start).to_std().ok())
            .unwrap_or_default();
        self.policy.limits_for(warm_day, since_start)
    }

    fn lock_retry(&self) -> Duration {
        Duration::from_std(self.ctx.lock_retry()).unwrap_or_else(|_| Duration::seconds(1))
    }

    async fn release_lock(&self, key: Option<&str>) {
        let Some(key) = key else { return };
        if let Err(e) = self.ctx.stores.locks.release(key, &self.ctx.instance_id).await {
            warn!(lock = key, "Failed to release dispatch lock: {}", e);
        }
    }

    /// Undo a selection that never turned into a send
    async fn abandon(&self, profile_id: ProfileId, permit: Permit, client_key: Option<&str>) {
        self.ctx.governor.release(permit);
        self.release_lock(Some(&profile_lock(profile_id))).await;
        self.release_lock(client_key).await;
    }

    async fn skip(
        &self,
        steps: Vec<Message>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        for message in steps {
            debug!(message_id = %message.id, reason, "Skipping message");
            self.ctx
                .stores
                .messages
                .skip(message.id, reason.to_string(), now)
                .await?;
        }
        Ok(())
    }

    /// Block until a send finishes, `wake` passes, or a control, settings
    /// or profile change arrives
    async fn wait(&mut self, wake: Option<DateTime<Utc>>) -> Result<(), DispatchError> {
        let wake = match wake {
            Some(at) => at,
            None if self.in_flight.is_empty() => self.ctx.clock.now() + self.lock_retry(),
            None => self.ctx.clock.now() + Duration::days(1),
        };
        let delay = until(self.ctx.clock.as_ref(), wake);

        tokio::select! {
            Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                match joined {
                    Ok(report) => self.handle_report(report).await?,
                    Err(e) => return Err(DispatchError::Task(e.to_string())),
                }
            }
            _ = sleep(delay) => {}
            changed = self.control.changed() => {
                if changed.is_err() {
                    self.stop.get_or_insert(Stop::Signalled(RunSignal::Shutdown));
                }
            }
            changed = self.settings.changed(), if self.settings_open => {
                match changed {
                    Ok(()) => self.reresolve().await?,
                    Err(_) => self.settings_open = false,
                }
            }
            event = self.events.recv(), if self.events_open => self.on_profile_event(event),
        }
        Ok(())
    }

    /// Finish every in-flight send before the run stops
    async fn drain(&mut self) {
        if !self.in_flight.is_empty() {
            info!(
                campaign_id = %self.campaign.id,
                in_flight = self.in_flight.len(),
                "Waiting for in-flight sends"
            );
        }
        while let Some(joined) = self.in_flight.join_next().await {
            match joined {
                Ok(report) => {
                    if let Err(e) = self.handle_report(report).await {
                        error!(campaign_id = %self.campaign.id, "Failed to settle send: {}", e);
                    }
                }
                Err(e) => error!(campaign_id = %self.campaign.id, "Send task failed: {}", e),
            }
        }
    }

    async fn handle_report(&mut self, report: SendReport) -> Result<(), DispatchError> {
        let SendReport {
            message,
            profile_id,
            permit,
            result,
            items_sent,
            client_lock,
        } = report;

        self.busy_profiles.remove(&profile_id);
        self.release_lock(Some(&profile_lock(profile_id))).await;
        self.release_lock(client_lock.as_deref()).await;

        let now = self.ctx.clock.now();
        let outcome = result.outcome;
        let sent = outcome == SendOutcome::Sent;
        self.ctx.metrics.record_send(outcome.label());
        let spacing = Duration::from_std(self.policy.contact_delay.sample(&mut self.rng))
            .unwrap_or_else(|_| Duration::zero());
        self.ctx.governor.settle(permit, sent, now, spacing);

        if let SendOutcome::CriticalFailure(cause) = outcome {
            self.on_critical(profile_id, cause);
        }

        let messages = &self.ctx.stores.messages;
        let step = if !sent && self.ctx.registry.availability(profile_id).is_down() {
            // Profile went down mid-send: back to the queue for another profile
            if !messages.requeue(message.id, result.detail, None, now).await? {
                return Err(DispatchError::RaceCondition {
                    message_id: message.id,
                });
            }
            StepResult::Retry(None)
        } else {
            match self.policy.retry.decide(outcome, message.attempts.max(0) as u32) {
                RetryDecision::Complete => {
                    if !messages
                        .complete(message.id, MessageStatus::Sent, None, now)
                        .await?
                    {
                        return Err(DispatchError::RaceCondition {
                            message_id: message.id,
                        });
                    }
                    self.tracker.record_success(profile_id);
                    let sent_for_client = messages
                        .count_sent_for_client(self.campaign.id, self.campaign.run, message.client_id)
                        .await?;
                    if sent_for_client == 1 {
                        self.ctx
                            .stores
                            .clients
                            .record_campaign_contact(message.client_id, now)
                            .await?;
                    }
                    StepResult::Sent
                }
                RetryDecision::Retry { after } => {
                    let at = now + Duration::from_std(after).unwrap_or_else(|_| Duration::zero());
                    if !messages.requeue(message.id, result.detail, Some(at), now).await? {
                        return Err(DispatchError::RaceCondition {
                            message_id: message.id,
                        });
                    }
                    debug!(message_id = %message.id, retry_at = %at, items_sent, "Send will be retried");
                    StepResult::Retry(Some(at))
                }
                RetryDecision::Fail => {
                    if !messages
                        .complete(message.id, MessageStatus::Failed, result.detail, now)
                        .await?
                    {
                        return Err(DispatchError::RaceCondition {
                            message_id: message.id,
                        });
                    }
                    StepResult::Failed
                }
            }
        };

        let target = self.campaign.target;
        let mut unneeded = Vec::new();
        if let Some(plan) = self.plans.iter_mut().find(|p| p.client_id == message.client_id) {
            if let (StepResult::Retry(_), Some(front)) = (step, plan.steps.front_mut()) {
                front.items_sent = items_sent;
            }
            unneeded = plan.finish_head(step, &target);
        }
        self.skip(unneeded, "delivered on an earlier channel", now).await?;
        self.plans.retain(|plan| plan.in_flight || !plan.is_done());

        self.update_progress().await
    }

    fn on_critical(&mut self, profile_id: ProfileId, cause: CriticalCause) {
        warn!(
            campaign_id = %self.campaign.id,
            profile_id = %profile_id,
            cause = %cause,
            "Critical profile error"
        );
        if cause == CriticalCause::LoginRequired {
            self.ctx
                .notifier
                .notify(Notification::LoginRequired { profile_id });
        }
        match self.tracker.record_critical(profile_id) {
            CriticalAction::PauseCampaign => {
                self.stop
                    .get_or_insert(Stop::Pause(PauseReason::CriticalErrors));
            }
            CriticalAction::SuspendProfile => {
                info!(profile_id = %profile_id, "Profile suspended for this campaign");
            }
            CriticalAction::Continue => {}
        }
    }

    async fn update_progress(&mut self) -> Result<(), DispatchError> {
        let counters = refresh_counters(&self.ctx.stores, self.campaign.id, self.campaign.run).await?;
        self.campaign.counters = counters;

        let percent = self.campaign.progress_percentage();
        for threshold in PROGRESS_THRESHOLDS {
            if threshold > self.progress_notified && percent >= f64::from(threshold) {
                self.progress_notified = threshold;
                self.ctx.notifier.notify(Notification::Progress {
                    campaign_id: self.campaign.id,
                    name: self.campaign.name.clone(),
                    percent: threshold,
                });
            }
        }
        Ok(())
    }

    async fn reresolve(&mut self) -> Result<(), DispatchError> {
        let snapshot = self.settings.borrow_and_update().clone();
        if snapshot.version == self.policy.settings_version {
            return Ok(());
        }
        let limits = self
            .ctx
            .stores
            .settings
            .user_limits(self.campaign.owner_id)
            .await?;
        match EffectivePolicy::resolve(&snapshot, limits.as_ref(), &self.campaign) {
            Ok(policy) => {
                info!(
                    campaign_id = %self.campaign.id,
                    version = policy.settings_version,
                    "Campaign policy re-resolved"
                );
                self.stream.update_policy(&policy);
                self.tracker.set_policy(policy.critical);
                self.policy = policy;
            }
            Err(e) => warn!(
                campaign_id = %self.campaign.id,
                "Keeping current policy, new settings rejected: {}", e
            ),
        }
        Ok(())
    }

    fn on_profile_event(&mut self, event: Result<ProfileEvent, RecvError>) {
        match event {
            Ok(event) if self.campaign.profile_ids.contains(&event.profile_id) => {
                if event.went_down() {
                    info!(
                        campaign_id = %self.campaign.id,
                        profile_id = %event.profile_id,
                        availability = %event.current,
                        "Profile left the eligible set"
                    );
                } else if event.recovered()
                    && self.policy.auto_resume
                    && self.tracker.reinstate(event.profile_id)
                {
                    info!(
                        campaign_id = %self.campaign.id,
                        profile_id = %event.profile_id,
                        "Suspended profile reinstated"
                    );
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                debug!(campaign_id = %self.campaign.id, missed, "Profile events lagged");
            }
            Err(RecvError::Closed) => self.events_open = false,
        }
    }

    async fn finish(&mut self, stop: Stop) -> RunExit {
        match self.settle_stop(stop).await {
            Ok(exit) => exit,
            Err(e) => fail_campaign(&self.ctx, self.campaign.id, e).await,
        }
    }

    async fn settle_stop(&mut self, stop: Stop) -> Result<RunExit, DispatchError> {
        let now = self.ctx.clock.now();
        let (id, run) = (self.campaign.id, self.campaign.run);
        let stores = self.ctx.stores.clone();

        match stop {
            Stop::Signalled(RunSignal::Cancel) => {
                let skipped = skip_pending(&stores, id, run, "campaign cancelled", now).await?;
                refresh_counters(&stores, id, run).await?;
                info!(campaign_id = %id, skipped, "Campaign cancelled");
                Ok(RunExit::Cancelled)
            }
            Stop::Signalled(RunSignal::Pause) => {
                refresh_counters(&stores, id, run).await?;
                let reason = stores
                    .campaigns
                    .get(id)
                    .await?
                    .and_then(|c| c.pause_reason)
                    .unwrap_or(PauseReason::Manual);
                Ok(RunExit::Paused(reason))
            }
            Stop::Signalled(_) => Ok(RunExit::Shutdown),
            Stop::Pause(reason) => {
                let transition = match reason {
                    PauseReason::ProfilesUnavailable => TransitionReason::ProfilesUnavailable,
                    _ => TransitionReason::CriticalErrors,
                };
                let change = StateChange::new(&ACTIVE, CampaignState::Paused, transition, now)
                    .with_pause_reason(reason);
                if !self.apply(change).await? {
                    return Ok(self.exit_from_state());
                }
                self.ctx.notifier.notify(Notification::CampaignError {
                    campaign_id: id,
                    name: self.campaign.name.clone(),
                    reason: format!("paused: {}", reason),
                });
                Ok(RunExit::Paused(reason))
            }
            Stop::Complete(reason) => {
                let skip_reason = match reason {
                    TransitionReason::RecurrenceEnded => "recurrence ended",
                    _ => "campaign completed",
                };
                skip_pending(&stores, id, run, skip_reason, now).await?;
                let counters = refresh_counters(&stores, id, run).await?;
                let change = StateChange::new(&ACTIVE, CampaignState::Completed, reason, now);
                if !self.apply(change).await? {
                    return Ok(self.exit_from_state());
                }
                info!(
                    campaign_id = %id,
                    sent = counters.sent,
                    failed = counters.failed,
                    skipped = counters.skipped,
                    "Campaign completed"
                );
                self.ctx.notifier.notify(Notification::CampaignCompleted {
                    campaign_id: id,
                    name: self.campaign.name.clone(),
                    counters,
                });
                Ok(RunExit::Completed)
            }
            Stop::Fail(e) => Err(e),
            Stop::Vanished => Ok(RunExit::Stopped),
        }
    }

    /// Exit for a campaign whose state changed underneath the run
    fn exit_from_state(&self) -> RunExit {
        match self.campaign.state {
            CampaignState::Paused => {
                RunExit::Paused(self.campaign.pause_reason.unwrap_or(PauseReason::Manual))
            }
            CampaignState::Cancelled => RunExit::Cancelled,
            CampaignState::Completed => RunExit::Completed,
            CampaignState::Error => RunExit::Failed,
            _ => RunExit::Stopped,
        }
    }
}
