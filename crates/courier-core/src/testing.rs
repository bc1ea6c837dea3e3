//! Fixtures shared by the unit and scenario tests

use crate::campaign::{CampaignManager, Supervisor};
use crate::clock::{Clock, TokioClock};
use crate::dispatch::{Dispatcher, EngineContext};
use crate::executor::{HealthProbe, SendExecutor, SendRequest, SendResult};
use crate::health::ProfileRegistry;
use crate::metrics::DispatchMetrics;
use crate::notify::{Notification, Notifier};
use crate::pacing::PacingGovernor;
use crate::settings::EffectivePolicy;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use courier_common::config::DispatchConfig;
use courier_common::types::{
    Availability, CampaignId, CampaignType, ChannelStatus, GroupId, MessengerTarget,
    OptionsConfig, ProfileId, ScheduleConfig, TemplateId,
};
use courier_common::{GlobalSettings, Result, VersionedSettings};
use courier_storage::{
    Campaign, Client, LockRepository, MemoryStore, NewCampaign, Stores, Template, TemplateItem,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Monday 2024-03-04 10:00 UTC
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
}

/// Directory entry; even clients also have a valid Telegram account
pub fn client(i: i64) -> Client {
    Client {
        id: Uuid::new_v4(),
        phone: format!("+7900{:07}", i),
        region: Some("north".to_string()),
        status: "active".to_string(),
        whatsapp_status: ChannelStatus::Valid,
        telegram_status: if i % 2 == 0 {
            ChannelStatus::Valid
        } else {
            ChannelStatus::Unknown
        },
        last_campaign_at: None,
        campaign_count: 0,
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(i),
    }
}

pub fn sample_new_campaign() -> NewCampaign {
    NewCampaign {
        owner_id: Uuid::new_v4(),
        name: "spring launch".to_string(),
        template_id: Uuid::new_v4(),
        group_id: Uuid::new_v4(),
        campaign_type: CampaignType::OneTime,
        target: MessengerTarget::WhatsappOnly,
        profile_ids: vec![Uuid::new_v4()],
        schedule: ScheduleConfig::default(),
        filter: Default::default(),
        options: OptionsConfig::default(),
        scheduled_at: None,
    }
}

/// A campaign in its first run
pub fn sample_campaign() -> Campaign {
    let mut campaign = sample_new_campaign().into_campaign(Uuid::new_v4(), base_time());
    campaign.run = 1;
    campaign.run_seed = 7;
    campaign
}

/// Short delays and generous caps so scenarios finish in little virtual time
pub fn fast_settings() -> GlobalSettings {
    GlobalSettings {
        min_delay_between_contacts_ms: 100,
        max_delay_between_contacts_ms: 200,
        min_delay_between_messages_ms: 10,
        max_delay_between_messages_ms: 20,
        max_contacts_per_hour: 1_000,
        max_contacts_per_day: 10_000,
        typing_simulation_enabled: false,
        max_retries_on_error: 2,
        retry_delay_ms: 1_000,
        retry_backoff_multiplier: 2.0,
        profile_health_check_interval_ms: 1_000,
        warmup_enabled: false,
        ..Default::default()
    }
}

pub fn policy_for(campaign: &Campaign) -> EffectivePolicy {
    EffectivePolicy::resolve(&VersionedSettings::initial(fast_settings()), None, campaign)
        .expect("fixture campaign resolves")
}

#[derive(Default)]
struct ExecutorState {
    scripted: HashMap<String, VecDeque<SendResult>>,
    fallback: Option<SendResult>,
    active: HashSet<ProfileId>,
    overlaps: usize,
    active_contacts: HashSet<String>,
    contact_overlaps: usize,
    requests: Vec<SendRequest>,
}

/// Executor with scripted results per contact; everything else is sent.
/// Records every request and any overlapping sends on one profile or to
/// one contact.
pub struct FakeExecutor {
    state: Mutex<ExecutorState>,
    latency: Duration,
}

impl FakeExecutor {
    pub fn new(latency: Duration) -> Self {
        Self {
            state: Mutex::new(ExecutorState::default()),
            latency,
        }
    }

    pub fn script(&self, contact: &str, results: Vec<SendResult>) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .insert(contact.to_string(), results.into());
    }

    /// Result for contacts without a script; `None` sends
    pub fn set_fallback(&self, result: Option<SendResult>) {
        self.state.lock().unwrap().fallback = result;
    }

    pub fn requests(&self) -> Vec<SendRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn requests_to(&self, contact: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.contact == contact)
            .count()
    }

    pub fn overlaps(&self) -> usize {
        self.state.lock().unwrap().overlaps
    }

    /// Requests that reached a contact while another was still in flight
    pub fn contact_overlaps(&self) -> usize {
        self.state.lock().unwrap().contact_overlaps
    }
}

#[async_trait]
impl SendExecutor for FakeExecutor {
    async fn send(&self, request: SendRequest) -> SendResult {
        let profile_id = request.profile_id;
        let contact = request.contact.clone();
        {
            let mut state = self.state.lock().unwrap();
            if !state.active.insert(profile_id) {
                state.overlaps += 1;
            }
            if !state.active_contacts.insert(contact.clone()) {
                state.contact_overlaps += 1;
            }
            state.requests.push(request);
        }

        tokio::time::sleep(self.latency).await;

        let mut state = self.state.lock().unwrap();
        state.active.remove(&profile_id);
        state.active_contacts.remove(&contact);
        let scripted = state.scripted.get_mut(&contact).and_then(|q| q.pop_front());
        scripted
            .or_else(|| state.fallback.clone())
            .unwrap_or_else(SendResult::sent)
    }
}

/// Probe reporting scripted availability; unknown profiles are available
#[derive(Default)]
pub struct FakeProbe {
    states: Mutex<HashMap<ProfileId, Availability>>,
}

impl FakeProbe {
    pub fn set(&self, profile_id: ProfileId, availability: Availability) {
        self.states.lock().unwrap().insert(profile_id, availability);
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn check_profile_health(&self, profile_id: ProfileId) -> Availability {
        self.states
            .lock()
            .unwrap()
            .get(&profile_id)
            .copied()
            .unwrap_or(Availability::Available)
    }
}

type LockCallback = Box<dyn FnOnce(&str) + Send>;

/// One-shot callback run when a matching lock is acquired
#[derive(Default)]
pub struct LockHook {
    armed: Mutex<Option<(String, LockCallback)>>,
}

impl LockHook {
    /// Run `callback` on the next successful acquire of a key starting with
    /// `prefix`
    pub fn arm(&self, prefix: &str, callback: impl FnOnce(&str) + Send + 'static) {
        *self.armed.lock().unwrap() = Some((prefix.to_string(), Box::new(callback)));
    }

    fn fire(&self, key: &str) {
        let callback = {
            let mut armed = self.armed.lock().unwrap();
            match armed.as_ref() {
                Some((prefix, _)) if key.starts_with(prefix.as_str()) => armed.take(),
                _ => None,
            }
        };
        if let Some((_, callback)) = callback {
            callback(key);
        }
    }
}

/// Lock repository that lets a test act in the middle of a dispatch pass
pub struct HookedLocks {
    inner: Arc<dyn LockRepository>,
    hook: Arc<LockHook>,
}

#[async_trait]
impl LockRepository for HookedLocks {
    async fn try_acquire(&self, key: &str, owner: &str, at: DateTime<Utc>) -> Result<bool> {
        let acquired = self.inner.try_acquire(key, owner, at).await?;
        if acquired {
            self.hook.fire(key);
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        self.inner.release(key, owner).await
    }

    async fn holder(&self, key: &str) -> Result<Option<String>> {
        self.inner.holder(key).await
    }

    async fn refresh(&self, owner: &str, at: DateTime<Utc>) -> Result<u64> {
        self.inner.refresh(owner, at).await
    }

    async fn live_owners(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        self.inner.live_owners(since).await
    }

    async fn release_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        self.inner.release_expired(before).await
    }

    async fn release_all_held_by(&self, owner: &str) -> Result<u64> {
        self.inner.release_all_held_by(owner).await
    }
}

pub fn test_config() -> DispatchConfig {
    DispatchConfig {
        poll_interval_secs: 1,
        lock_retry_ms: 100,
        candidate_batch_size: 4,
        ..Default::default()
    }
}

/// Dispatcher and manager over an in-memory store, a virtual clock and a
/// fake executor. Must be built inside a tokio runtime.
pub struct TestEngine {
    pub manager: CampaignManager,
    pub lock_hook: Arc<LockHook>,
    pub dispatcher: Arc<Dispatcher>,
    pub stores: Stores,
    pub memory: MemoryStore,
    pub clock: TokioClock,
    pub executor: Arc<FakeExecutor>,
    pub registry: Arc<ProfileRegistry>,
    pub notifications: mpsc::Receiver<Notification>,
    pub template_id: TemplateId,
    pub group_id: GroupId,
    pub profiles: Vec<ProfileId>,
    pub clients: Vec<Client>,
}

/// Shape of a [`TestEngine`]
pub struct Fixture {
    pub profiles: usize,
    pub clients: usize,
    pub settings: GlobalSettings,
    pub config: DispatchConfig,
    /// Executor time per payload item
    pub latency: Duration,
    pub template_items: usize,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            profiles: 1,
            clients: 0,
            settings: fast_settings(),
            config: test_config(),
            latency: Duration::from_millis(50),
            template_items: 1,
        }
    }
}

impl TestEngine {
    pub fn new(profiles: usize, clients: usize) -> Self {
        Self::with_settings(profiles, clients, fast_settings())
    }

    pub fn with_settings(profiles: usize, clients: usize, settings: GlobalSettings) -> Self {
        Self::build(Fixture {
            profiles,
            clients,
            settings,
            ..Fixture::default()
        })
    }

    pub fn build(fixture: Fixture) -> Self {
        let Fixture {
            profiles,
            clients,
            settings,
            config,
            latency,
            template_items,
        } = fixture;
        let memory = MemoryStore::new();
        let lock_hook = Arc::new(LockHook::default());
        let mut stores = Stores::memory(memory.clone());
        stores.locks = Arc::new(HookedLocks {
            inner: stores.locks.clone(),
            hook: lock_hook.clone(),
        });
        let clock = TokioClock::new(base_time());

        let template_id = Uuid::new_v4();
        memory.insert_template(Template {
            id: template_id,
            items: (0..template_items.max(1))
                .map(|i| TemplateItem {
                    kind: "text".to_string(),
                    content: serde_json::json!({ "text": format!("Spring prices are here ({})", i + 1) }),
                })
                .collect(),
        });

        let group_id = Uuid::new_v4();
        let clients: Vec<Client> = (0..clients as i64).map(client).collect();
        for c in &clients {
            memory.insert_client(group_id, c.clone());
        }
        let profiles: Vec<ProfileId> = (0..profiles).map(|_| Uuid::new_v4()).collect();

        let executor = Arc::new(FakeExecutor::new(latency));
        let registry = Arc::new(ProfileRegistry::new());
        let (notifier, notifications) = Notifier::channel(1_024);
        let (settings_tx, settings_rx) = watch::channel(Arc::new(VersionedSettings {
            version: 0,
            settings,
            updated_at: clock.now(),
        }));

        let ctx = Arc::new(EngineContext {
            stores: stores.clone(),
            executor: executor.clone(),
            governor: Arc::new(PacingGovernor::new()),
            registry: registry.clone(),
            notifier,
            metrics: DispatchMetrics::new().unwrap(),
            clock: Arc::new(clock),
            settings: settings_rx,
            config,
            instance_id: "courier-test".to_string(),
        });
        let dispatcher = Arc::new(Dispatcher::new(ctx));
        let manager = CampaignManager::new(dispatcher.clone(), settings_tx);

        Self {
            manager,
            lock_hook,
            dispatcher,
            stores,
            memory,
            clock,
            executor,
            registry,
            notifications,
            template_id,
            group_id,
            profiles,
            clients,
        }
    }

    /// Campaign input targeting this engine's group, template and profiles
    pub fn new_campaign(&self) -> NewCampaign {
        NewCampaign {
            template_id: self.template_id,
            group_id: self.group_id,
            profile_ids: self.profiles.clone(),
            ..sample_new_campaign()
        }
    }

    pub async fn draft(&self) -> Campaign {
        self.manager.create(self.new_campaign()).await.unwrap()
    }

    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(self.dispatcher.clone())
    }

    /// Dispatcher of a second engine instance sharing this engine's
    /// storage, executor and clock
    pub fn peer(&self, instance_id: &str) -> Arc<Dispatcher> {
        let ctx = self.dispatcher.context();
        Arc::new(Dispatcher::new(Arc::new(EngineContext {
            stores: self.stores.clone(),
            executor: self.executor.clone(),
            governor: Arc::new(PacingGovernor::new()),
            registry: Arc::new(ProfileRegistry::new()),
            notifier: Notifier::disabled(),
            metrics: DispatchMetrics::new().unwrap(),
            clock: Arc::new(self.clock),
            settings: ctx.settings.clone(),
            config: ctx.config.clone(),
            instance_id: instance_id.to_string(),
        })))
    }

    /// Poll until `done` holds, advancing virtual time; panics after `within`
    pub async fn wait_for(
        &self,
        id: CampaignId,
        within: Duration,
        done: impl Fn(&Campaign) -> bool,
    ) -> Campaign {
        let step = (within / 1_000).max(Duration::from_millis(50));
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let campaign = self.manager.status(id).await.unwrap();
            if done(&campaign) {
                return campaign;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "campaign stuck in {} with {:?}",
                campaign.state,
                campaign.counters
            );
            tokio::time::sleep(step).await;
        }
    }

    /// Wait until the campaign's run task has exited
    pub async fn wait_idle(&self, id: CampaignId) {
        for _ in 0..10_000 {
            if !self.dispatcher.is_active(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("campaign run did not stop");
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n);
        }
        out
    }
}
