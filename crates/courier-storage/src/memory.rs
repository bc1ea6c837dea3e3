//! In-memory store
//!
//! Implements every repository trait over a single mutex-guarded state.
//! Used by the engine tests and for single-process runs without a
//! database; state is lost when the process exits.

use crate::models::{
    Campaign, CampaignCounters, CampaignState, CampaignTransition, Client, ClientCursor, Message,
    MessageCounts, MessageStatus, NewCampaign, NewMessage, ProfileState, StateChange, Template,
};
use crate::repository::{
    CampaignRepository, ClientRepository, LockRepository, MessageRepository, ProfileRepository,
    SentQuery, SettingsRepository, TemplateRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::types::{
    Availability, CampaignId, ClientId, GroupId, MessageId, ProfileId, TemplateId, TenantId,
};
use courier_common::{Error, GlobalSettings, Result, UserCampaignLimits, VersionedSettings};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Default)]
struct State {
    campaigns: HashMap<CampaignId, Campaign>,
    transitions: Vec<CampaignTransition>,
    messages: Vec<Message>,
    clients: HashMap<ClientId, Client>,
    groups: HashMap<GroupId, Vec<ClientId>>,
    templates: HashMap<TemplateId, Template>,
    settings: Option<VersionedSettings>,
    limits: HashMap<TenantId, UserCampaignLimits>,
    profiles: HashMap<ProfileId, ProfileState>,
    /// Key -> (owner, last refresh)
    locks: HashMap<String, (String, DateTime<Utc>)>,
}

impl State {
    fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    fn group_members(&self, group_id: GroupId) -> Vec<&Client> {
        let mut members: Vec<&Client> = self
            .groups
            .get(&group_id)
            .map(|ids| ids.iter().filter_map(|id| self.clients.get(id)).collect())
            .unwrap_or_default();
        members.sort_by_key(|c| (c.created_at, c.id));
        members
    }
}

/// In-memory implementation of all repositories
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a client to the directory and to `group_id`
    pub fn insert_client(&self, group_id: GroupId, client: Client) {
        let mut state = self.state();
        let members = state.groups.entry(group_id).or_default();
        if !members.contains(&client.id) {
            members.push(client.id);
        }
        state.clients.insert(client.id, client);
    }

    pub fn insert_template(&self, template: Template) {
        self.state().templates.insert(template.id, template);
    }

    pub fn insert_profile(&self, profile: ProfileState) {
        self.state().profiles.insert(profile.profile_id, profile);
    }

    /// Insert a message as-is, bypassing the unique key check
    pub fn insert_message(&self, message: Message) {
        self.state().messages.push(message);
    }

    /// Snapshot of all messages of a campaign
    pub fn messages_of(&self, campaign_id: CampaignId) -> Vec<Message> {
        self.state()
            .messages
            .iter()
            .filter(|m| m.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    pub fn client(&self, id: ClientId) -> Option<Client> {
        self.state().clients.get(&id).cloned()
    }

}

#[async_trait]
impl CampaignRepository for MemoryStore {
    async fn create(&self, input: NewCampaign) -> Result<Campaign> {
        let campaign = input.into_campaign(Uuid::now_v7(), Utc::now());
        self.state().campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.state().campaigns.get(&id).cloned())
    }

    async fn list_by_states(&self, states: &[CampaignState]) -> Result<Vec<Campaign>> {
        let mut campaigns: Vec<Campaign> = self
            .state()
            .campaigns
            .values()
            .filter(|c| states.contains(&c.state))
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }

    async fn count_active_by_owner(&self, owner_id: TenantId) -> Result<i64> {
        Ok(self
            .state()
            .campaigns
            .values()
            .filter(|c| c.owner_id == owner_id && c.state.is_active())
            .count() as i64)
    }

    async fn transition(&self, id: CampaignId, change: StateChange) -> Result<Option<Campaign>> {
        let mut state = self.state();
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(None);
        };
        if !change.applies_to(campaign) {
            return Ok(None);
        }
        let record = change.apply(campaign);
        let updated = campaign.clone();
        state.transitions.push(record);
        Ok(Some(updated))
    }

    async fn transitions(&self, id: CampaignId) -> Result<Vec<CampaignTransition>> {
        Ok(self
            .state()
            .transitions
            .iter()
            .filter(|t| t.campaign_id == id)
            .cloned()
            .collect())
    }

    async fn start_run(
        &self,
        id: CampaignId,
        seed: i64,
        total_recipients: i64,
        at: DateTime<Utc>,
    ) -> Result<Campaign> {
        let mut state = self.state();
        let campaign = state
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Campaign {}", id)))?;
        campaign.run += 1;
        campaign.run_seed = seed;
        campaign.total_recipients = total_recipients;
        campaign.counters = CampaignCounters::default();
        campaign.started_at = Some(at);
        campaign.completed_at = None;
        campaign.updated_at = at;
        Ok(campaign.clone())
    }

    async fn set_counters(&self, id: CampaignId, counters: CampaignCounters) -> Result<()> {
        if let Some(campaign) = self.state().campaigns.get_mut(&id) {
            campaign.counters = counters;
        }
        Ok(())
    }

    async fn set_run_seed(&self, id: CampaignId, seed: i64) -> Result<()> {
        if let Some(campaign) = self.state().campaigns.get_mut(&id) {
            campaign.run_seed = seed;
        }
        Ok(())
    }

    async fn list_finished_before(&self, before: DateTime<Utc>) -> Result<Vec<CampaignId>> {
        Ok(self
            .state()
            .campaigns
            .values()
            .filter(|c| c.state.is_terminal() && c.completed_at.is_some_and(|at| at < before))
            .map(|c| c.id)
            .collect())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create(&self, input: NewMessage, at: DateTime<Utc>) -> Result<Option<Message>> {
        let mut state = self.state();
        let exists = state.messages.iter().any(|m| {
            m.campaign_id == input.campaign_id
                && m.run == input.run
                && m.client_id == input.client_id
                && m.channel == input.channel
                && m.phone == input.phone
        });
        if exists {
            return Ok(None);
        }

        let message = Message {
            id: Uuid::now_v7(),
            campaign_id: input.campaign_id,
            run: input.run,
            client_id: input.client_id,
            profile_id: None,
            channel: input.channel,
            phone: input.phone,
            step: input.step,
            status: MessageStatus::Pending,
            attempts: 0,
            items_sent: 0,
            claimed_by: None,
            last_error: None,
            next_attempt_at: None,
            created_at: at,
            updated_at: at,
            sent_at: None,
            archived: false,
        };
        state.messages.push(message.clone());
        Ok(Some(message))
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.state().messages.iter().find(|m| m.id == id).cloned())
    }

    async fn claim(
        &self,
        id: MessageId,
        profile_id: ProfileId,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let mut state = self.state();
        match state.message_mut(id) {
            Some(message) if message.status == MessageStatus::Pending => {
                message.status = MessageStatus::Processing;
                message.profile_id = Some(profile_id);
                message.claimed_by = Some(owner.to_string());
                message.attempts += 1;
                message.next_attempt_at = None;
                message.updated_at = at;
                Ok(Some(message.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(
        &self,
        id: MessageId,
        status: MessageStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !MessageStatus::Processing.can_transition_to(status) || !status.is_terminal() {
            return Err(Error::Validation(format!(
                "Cannot complete message with status {}",
                status
            )));
        }

        let mut state = self.state();
        match state.message_mut(id) {
            Some(message) if message.status == MessageStatus::Processing => {
                message.status = status;
                if error.is_some() {
                    message.last_error = error;
                }
                if status == MessageStatus::Sent {
                    message.sent_at = Some(at);
                }
                message.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue(
        &self,
        id: MessageId,
        error: Option<String>,
        next_attempt_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        match state.message_mut(id) {
            Some(message) if message.status == MessageStatus::Processing => {
                message.status = MessageStatus::Pending;
                if error.is_some() {
                    message.last_error = error;
                }
                message.next_attempt_at = next_attempt_at;
                message.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn skip(&self, id: MessageId, reason: String, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state();
        match state.message_mut(id) {
            Some(message) if message.status == MessageStatus::Pending => {
                message.status = MessageStatus::Skipped;
                message.last_error = Some(reason);
                message.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_progress(
        &self,
        id: MessageId,
        items_sent: i32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(message) = self.state().message_mut(id) {
            message.items_sent = items_sent;
            message.updated_at = at;
        }
        Ok(())
    }

    async fn pending_for_run(&self, campaign_id: CampaignId, run: i32) -> Result<Vec<Message>> {
        let mut pending: Vec<Message> = self
            .state()
            .messages
            .iter()
            .filter(|m| {
                m.campaign_id == campaign_id && m.run == run && m.status == MessageStatus::Pending
            })
            .cloned()
            .collect();
        pending.sort_by_key(|m| (m.created_at, m.step));
        Ok(pending)
    }

    async fn requeue_orphaned(&self, live_owners: &[String], at: DateTime<Utc>) -> Result<u64> {
        let mut reset = 0;
        for message in self.state().messages.iter_mut().filter(|m| {
            m.status == MessageStatus::Processing
                && !m
                    .claimed_by
                    .as_ref()
                    .is_some_and(|owner| live_owners.contains(owner))
        }) {
            message.status = MessageStatus::Pending;
            message.claimed_by = None;
            message.updated_at = at;
            reset += 1;
        }
        Ok(reset)
    }

    async fn admitted_clients(&self, campaign_id: CampaignId, run: i32) -> Result<Vec<ClientId>> {
        let mut seen = HashSet::new();
        Ok(self
            .state()
            .messages
            .iter()
            .filter(|m| m.campaign_id == campaign_id && m.run == run)
            .filter(|m| seen.insert(m.client_id))
            .map(|m| m.client_id)
            .collect())
    }

    async fn sent_clients(&self, query: SentQuery) -> Result<HashSet<ClientId>> {
        Ok(self
            .state()
            .messages
            .iter()
            .filter(|m| m.status == MessageStatus::Sent)
            .filter(|m| m.sent_at.is_some_and(|at| at >= query.since))
            .filter(|m| query.client_ids.contains(&m.client_id))
            .filter(|m| {
                query
                    .campaign_ids
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&m.campaign_id))
            })
            .filter(|m| query.exclude_run != Some((m.campaign_id, m.run)))
            .map(|m| m.client_id)
            .collect())
    }

    async fn count_sent_for_client(
        &self,
        campaign_id: CampaignId,
        run: i32,
        client_id: ClientId,
    ) -> Result<i64> {
        Ok(self
            .state()
            .messages
            .iter()
            .filter(|m| {
                m.campaign_id == campaign_id
                    && m.run == run
                    && m.client_id == client_id
                    && m.status == MessageStatus::Sent
            })
            .count() as i64)
    }

    async fn counts(&self, campaign_id: CampaignId, run: i32) -> Result<MessageCounts> {
        let mut counts = MessageCounts::default();
        for message in self
            .state()
            .messages
            .iter()
            .filter(|m| m.campaign_id == campaign_id && m.run == run)
        {
            match message.status {
                MessageStatus::Pending => counts.pending += 1,
                MessageStatus::Processing => counts.processing += 1,
                MessageStatus::Sent => counts.sent += 1,
                MessageStatus::Failed => counts.failed += 1,
                MessageStatus::Skipped => counts.skipped += 1,
            }
        }
        Ok(counts)
    }

    async fn sent_times_since(
        &self,
        profile_id: ProfileId,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let mut times: Vec<DateTime<Utc>> = self
            .state()
            .messages
            .iter()
            .filter(|m| m.profile_id == Some(profile_id) && m.status == MessageStatus::Sent)
            .filter_map(|m| m.sent_at)
            .filter(|at| *at >= since)
            .collect();
        times.sort();
        Ok(times)
    }

    async fn archive_campaign(&self, campaign_id: CampaignId) -> Result<u64> {
        let mut archived = 0;
        for message in self
            .state()
            .messages
            .iter_mut()
            .filter(|m| m.campaign_id == campaign_id && !m.archived)
        {
            message.archived = true;
            archived += 1;
        }
        Ok(archived)
    }

    async fn list_by_campaign(
        &self,
        campaign_id: CampaignId,
        status: Option<MessageStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .state()
            .messages
            .iter()
            .filter(|m| m.campaign_id == campaign_id)
            .filter(|m| status.map_or(true, |s| m.status == s))
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.step));
        Ok(messages
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl ClientRepository for MemoryStore {
    async fn page(
        &self,
        group_id: GroupId,
        after: Option<ClientCursor>,
        limit: u32,
    ) -> Result<Vec<Client>> {
        let state = self.state();
        Ok(state
            .group_members(group_id)
            .into_iter()
            .filter(|c| after.map_or(true, |cur| (c.created_at, c.id) > (cur.created_at, cur.id)))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn ids(&self, group_id: GroupId) -> Result<Vec<ClientId>> {
        let state = self.state();
        Ok(state
            .group_members(group_id)
            .into_iter()
            .map(|c| c.id)
            .collect())
    }

    async fn get_many(&self, ids: &[ClientId]) -> Result<Vec<Client>> {
        let state = self.state();
        Ok(ids
            .iter()
            .filter_map(|id| state.clients.get(id).cloned())
            .collect())
    }

    async fn record_campaign_contact(&self, id: ClientId, at: DateTime<Utc>) -> Result<()> {
        if let Some(client) = self.state().clients.get_mut(&id) {
            client.last_campaign_at = Some(at);
            client.campaign_count += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsRepository for MemoryStore {
    async fn load_global(&self) -> Result<Option<VersionedSettings>> {
        Ok(self.state().settings.clone())
    }

    async fn save_global(
        &self,
        settings: GlobalSettings,
        at: DateTime<Utc>,
    ) -> Result<VersionedSettings> {
        let mut state = self.state();
        let version = state.settings.as_ref().map_or(1, |s| s.version + 1);
        let saved = VersionedSettings {
            version,
            settings,
            updated_at: at,
        };
        state.settings = Some(saved.clone());
        Ok(saved)
    }

    async fn user_limits(&self, user_id: TenantId) -> Result<Option<UserCampaignLimits>> {
        Ok(self.state().limits.get(&user_id).cloned())
    }

    async fn save_user_limits(&self, limits: UserCampaignLimits) -> Result<()> {
        self.state().limits.insert(limits.user_id, limits);
        Ok(())
    }
}

#[async_trait]
impl ProfileRepository for MemoryStore {
    async fn get(&self, id: ProfileId) -> Result<Option<ProfileState>> {
        Ok(self.state().profiles.get(&id).cloned())
    }

    async fn set_availability(
        &self,
        id: ProfileId,
        availability: Availability,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state();
        let profile = state.profiles.entry(id).or_insert_with(|| ProfileState {
            profile_id: id,
            availability,
            first_used_at: None,
            last_checked_at: None,
        });
        profile.availability = availability;
        profile.last_checked_at = Some(at);
        Ok(())
    }

    async fn mark_first_used(&self, id: ProfileId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        let profile = state.profiles.entry(id).or_insert_with(|| ProfileState {
            profile_id: id,
            availability: Availability::Available,
            first_used_at: None,
            last_checked_at: None,
        });
        profile.first_used_at.get_or_insert(at);
        Ok(())
    }
}

#[async_trait]
impl LockRepository for MemoryStore {
    async fn try_acquire(&self, key: &str, owner: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state();
        if state.locks.contains_key(key) {
            return Ok(false);
        }
        state
            .locks
            .insert(key.to_string(), (owner.to_string(), at));
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut state = self.state();
        if state.locks.get(key).is_some_and(|(holder, _)| holder == owner) {
            state.locks.remove(key);
        }
        Ok(())
    }

    async fn holder(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state().locks.get(key).map(|(owner, _)| owner.clone()))
    }

    async fn refresh(&self, owner: &str, at: DateTime<Utc>) -> Result<u64> {
        let mut refreshed = 0;
        for (holder, refreshed_at) in self.state().locks.values_mut() {
            if holder == owner {
                *refreshed_at = at;
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    async fn live_owners(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let owners: HashSet<String> = self
            .state()
            .locks
            .values()
            .filter(|(_, at)| *at >= since)
            .map(|(owner, _)| owner.clone())
            .collect();
        Ok(owners.into_iter().collect())
    }

    async fn release_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let count = state.locks.len();
        state.locks.retain(|_, (_, at)| *at >= before);
        Ok((count - state.locks.len()) as u64)
    }

    async fn release_all_held_by(&self, owner: &str) -> Result<u64> {
        let mut state = self.state();
        let count = state.locks.len();
        state.locks.retain(|_, (holder, _)| holder != owner);
        Ok((count - state.locks.len()) as u64)
    }
}

#[async_trait]
impl TemplateRepository for MemoryStore {
    async fn get(&self, id: TemplateId) -> Result<Option<Template>> {
        Ok(self.state().templates.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransitionReason;
    use courier_common::types::{
        CampaignType, Channel, ChannelStatus, FilterConfig, MessengerTarget, OptionsConfig,
        ScheduleConfig,
    };
    use pretty_assertions::assert_eq;

    fn client(n: i64) -> Client {
        Client {
            id: Uuid::new_v4(),
            phone: format!("+7999000{:04}", n),
            region: None,
            status: "active".to_string(),
            whatsapp_status: ChannelStatus::Valid,
            telegram_status: ChannelStatus::Unknown,
            last_campaign_at: None,
            campaign_count: 0,
            created_at: DateTime::from_timestamp(1_700_000_000 + n, 0).unwrap(),
        }
    }

    fn new_campaign() -> NewCampaign {
        NewCampaign {
            owner_id: Uuid::new_v4(),
            name: "spring".to_string(),
            template_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            campaign_type: CampaignType::OneTime,
            target: MessengerTarget::WhatsappOnly,
            profile_ids: vec![Uuid::new_v4()],
            schedule: ScheduleConfig::default(),
            filter: FilterConfig::default(),
            options: OptionsConfig::default(),
            scheduled_at: None,
        }
    }

    fn new_message(campaign_id: CampaignId, client_id: ClientId) -> NewMessage {
        NewMessage {
            campaign_id,
            run: 1,
            client_id,
            channel: Channel::Whatsapp,
            phone: "+79990000001".to_string(),
            step: 0,
        }
    }

    #[tokio::test]
    async fn test_transition_compare_and_set() {
        let store = MemoryStore::new();
        let campaign = CampaignRepository::create(&store, new_campaign()).await.unwrap();
        let now = Utc::now();

        let queued = store
            .transition(
                campaign.id,
                StateChange::new(
                    &[CampaignState::Draft],
                    CampaignState::Queued,
                    TransitionReason::Activated,
                    now,
                ),
            )
            .await
            .unwrap();
        assert_eq!(queued.map(|c| c.state), Some(CampaignState::Queued));

        // Second activation from DRAFT no longer applies
        let again = store
            .transition(
                campaign.id,
                StateChange::new(
                    &[CampaignState::Draft],
                    CampaignState::Queued,
                    TransitionReason::Activated,
                    now,
                ),
            )
            .await
            .unwrap();
        assert!(again.is_none());

        let history = store.transitions(campaign.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "activated");
    }

    #[tokio::test]
    async fn test_message_unique_key_and_claim() {
        let store = MemoryStore::new();
        let campaign_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        let now = Utc::now();

        let created = MessageRepository::create(&store, new_message(campaign_id, client_id), now)
            .await
            .unwrap()
            .unwrap();
        let duplicate = MessageRepository::create(&store, new_message(campaign_id, client_id), now)
            .await
            .unwrap();
        assert!(duplicate.is_none());

        let profile = Uuid::new_v4();
        let claimed = store.claim(created.id, profile, "a", now).await.unwrap().unwrap();
        assert_eq!(claimed.status, MessageStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(store.claim(created.id, profile, "a", now).await.unwrap().is_none());

        assert!(!store.skip(created.id, "late".into(), now).await.unwrap());
        assert!(store
            .complete(created.id, MessageStatus::Sent, None, now)
            .await
            .unwrap());
        assert!(store
            .complete(created.id, MessageStatus::Pending, None, now)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_sent_clients_scope() {
        let store = MemoryStore::new();
        let campaign_a = Uuid::new_v4();
        let campaign_b = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        let now = Utc::now();

        let message = MessageRepository::create(&store, new_message(campaign_a, client_id), now)
            .await
            .unwrap()
            .unwrap();
        store.claim(message.id, Uuid::new_v4(), "a", now).await.unwrap();
        store
            .complete(message.id, MessageStatus::Sent, None, now)
            .await
            .unwrap();

        let query = |campaign_ids: Option<Vec<CampaignId>>, exclude_run| SentQuery {
            client_ids: vec![client_id],
            campaign_ids,
            exclude_run,
            since: now - chrono::Duration::hours(1),
        };

        assert!(store
            .sent_clients(query(Some(vec![campaign_a]), None))
            .await
            .unwrap()
            .contains(&client_id));
        assert!(store
            .sent_clients(query(Some(vec![campaign_b]), None))
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .sent_clients(query(None, Some((campaign_a, 1))))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_group_paging() {
        let store = MemoryStore::new();
        let group = Uuid::new_v4();
        let clients: Vec<Client> = (0..5).map(client).collect();
        for c in clients.iter().rev() {
            store.insert_client(group, c.clone());
        }

        let first = store.page(group, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, clients[0].id);

        let cursor = ClientCursor::from(&first[1]);
        let rest = store.page(group, Some(cursor), 10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].id, clients[2].id);
    }

    #[tokio::test]
    async fn test_locks() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert!(store.try_acquire("profile:1", "a", now).await.unwrap());
        assert!(!store.try_acquire("profile:1", "b", now).await.unwrap());
        store.release("profile:1", "b").await.unwrap();
        assert_eq!(store.holder("profile:1").await.unwrap().as_deref(), Some("a"));

        assert_eq!(
            store
                .release_expired(now + chrono::Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
        assert!(store.try_acquire("profile:1", "b", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_refreshed_locks_outlive_expiry() {
        let store = MemoryStore::new();
        let start = Utc::now();
        let later = start + chrono::Duration::seconds(30);
        store.try_acquire("instance:a", "a", start).await.unwrap();
        store.try_acquire("profile:1", "a", start).await.unwrap();
        store.try_acquire("instance:b", "b", start).await.unwrap();
        store.try_acquire("profile:2", "b", start).await.unwrap();

        // Only `a` keeps heartbeating
        assert_eq!(store.refresh("a", later).await.unwrap(), 2);
        let cutoff = later - chrono::Duration::seconds(10);
        assert_eq!(store.live_owners(cutoff).await.unwrap(), vec!["a".to_string()]);
        assert_eq!(store.release_expired(cutoff).await.unwrap(), 2);
        assert_eq!(store.holder("profile:1").await.unwrap().as_deref(), Some("a"));
        assert!(store.holder("profile:2").await.unwrap().is_none());

        assert_eq!(store.release_all_held_by("a").await.unwrap(), 2);
        assert!(store.live_owners(start).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_orphaned_spares_live_claims() {
        let store = MemoryStore::new();
        let campaign_id = Uuid::new_v4();
        let now = Utc::now();
        let live = MessageRepository::create(&store, new_message(campaign_id, Uuid::new_v4()), now)
            .await
            .unwrap()
            .unwrap();
        let dead = MessageRepository::create(&store, new_message(campaign_id, Uuid::new_v4()), now)
            .await
            .unwrap()
            .unwrap();
        store.claim(live.id, Uuid::new_v4(), "a", now).await.unwrap();
        store.claim(dead.id, Uuid::new_v4(), "b", now).await.unwrap();

        let requeued = store.requeue_orphaned(&["a".to_string()], now).await.unwrap();
        assert_eq!(requeued, 1);

        let live = MessageRepository::get(&store, live.id).await.unwrap().unwrap();
        assert_eq!(live.status, MessageStatus::Processing);
        assert_eq!(live.claimed_by.as_deref(), Some("a"));
        let dead = MessageRepository::get(&store, dead.id).await.unwrap().unwrap();
        assert_eq!(dead.status, MessageStatus::Pending);
        assert!(dead.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_settings_versioning() {
        let store = MemoryStore::new();
        assert!(store.load_global().await.unwrap().is_none());
        let first = store
            .save_global(GlobalSettings::default(), Utc::now())
            .await
            .unwrap();
        let second = store
            .save_global(GlobalSettings::default(), Utc::now())
            .await
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
    }
}
