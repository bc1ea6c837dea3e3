//! Persistence models

use chrono::{DateTime, Utc};
use courier_common::types::{
    Availability, CampaignId, CampaignType, Channel, ChannelStatus, ClientId, FilterConfig,
    GroupId, MessageId, MessengerTarget, OptionsConfig, ProfileId, ScheduleConfig, TemplateId,
    TenantId,
};
use serde::{Deserialize, Serialize};

/// Campaign lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Draft,
    Scheduled,
    Queued,
    Running,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl CampaignState {
    /// States that end a run; only a recurring COMPLETED campaign is re-armed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignState::Completed | CampaignState::Cancelled | CampaignState::Error
        )
    }

    /// States counted against a tenant's active campaign limit
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CampaignState::Scheduled
                | CampaignState::Queued
                | CampaignState::Running
                | CampaignState::Paused
        )
    }

    /// Whether the lifecycle permits moving from `self` to `to`
    pub fn can_transition_to(&self, to: CampaignState) -> bool {
        use CampaignState::*;
        matches!(
            (self, to),
            (Draft, Scheduled)
                | (Draft, Queued)
                | (Scheduled, Queued)
                | (Scheduled, Cancelled)
                | (Queued, Running)
                | (Queued, Paused)
                | (Queued, Completed)
                | (Queued, Cancelled)
                | (Queued, Error)
                | (Running, Queued)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Error)
                | (Paused, Running)
                | (Paused, Queued)
                | (Paused, Cancelled)
                | (Completed, Scheduled)
        )
    }
}

impl std::fmt::Display for CampaignState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignState::Draft => write!(f, "draft"),
            CampaignState::Scheduled => write!(f, "scheduled"),
            CampaignState::Queued => write!(f, "queued"),
            CampaignState::Running => write!(f, "running"),
            CampaignState::Paused => write!(f, "paused"),
            CampaignState::Completed => write!(f, "completed"),
            CampaignState::Cancelled => write!(f, "cancelled"),
            CampaignState::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for CampaignState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignState::Draft),
            "scheduled" => Ok(CampaignState::Scheduled),
            "queued" => Ok(CampaignState::Queued),
            "running" => Ok(CampaignState::Running),
            "paused" => Ok(CampaignState::Paused),
            "completed" => Ok(CampaignState::Completed),
            "cancelled" => Ok(CampaignState::Cancelled),
            "error" => Ok(CampaignState::Error),
            _ => Err(format!("Invalid campaign state: {}", s)),
        }
    }
}

/// Why a campaign is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    CriticalErrors,
    ProfilesUnavailable,
}

impl PauseReason {
    /// Pauses that may be lifted without an operator
    pub fn is_auto_resumable(&self) -> bool {
        !matches!(self, PauseReason::Manual)
    }
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PauseReason::Manual => write!(f, "manual"),
            PauseReason::CriticalErrors => write!(f, "critical_errors"),
            PauseReason::ProfilesUnavailable => write!(f, "profiles_unavailable"),
        }
    }
}

impl std::str::FromStr for PauseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(PauseReason::Manual),
            "critical_errors" => Ok(PauseReason::CriticalErrors),
            "profiles_unavailable" => Ok(PauseReason::ProfilesUnavailable),
            _ => Err(format!("Invalid pause reason: {}", s)),
        }
    }
}

/// Reason code recorded with every campaign state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Activated,
    ScheduledStart,
    WindowOpened,
    WindowClosed,
    CandidatesExhausted,
    RecurrenceEnded,
    Rescheduled,
    ManualPause,
    ManualResume,
    AutoResumed,
    /// Held after a restart without auto-resume
    Restarted,
    CriticalErrors,
    ProfilesUnavailable,
    Cancelled,
    RaceCondition,
    Fatal,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionReason::Activated => "activated",
            TransitionReason::ScheduledStart => "scheduled_start",
            TransitionReason::WindowOpened => "window_opened",
            TransitionReason::WindowClosed => "window_closed",
            TransitionReason::CandidatesExhausted => "candidates_exhausted",
            TransitionReason::RecurrenceEnded => "recurrence_ended",
            TransitionReason::Rescheduled => "rescheduled",
            TransitionReason::ManualPause => "manual_pause",
            TransitionReason::ManualResume => "manual_resume",
            TransitionReason::AutoResumed => "auto_resumed",
            TransitionReason::Restarted => "restarted",
            TransitionReason::CriticalErrors => "critical_errors",
            TransitionReason::ProfilesUnavailable => "profiles_unavailable",
            TransitionReason::Cancelled => "cancelled",
            TransitionReason::RaceCondition => "race_condition",
            TransitionReason::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-campaign outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub sent: i64,
    pub failed: i64,
    pub skipped: i64,
    pub remaining: i64,
}

/// Campaign model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub owner_id: TenantId,
    pub name: String,
    pub template_id: TemplateId,
    pub group_id: GroupId,
    pub campaign_type: CampaignType,
    pub target: MessengerTarget,
    pub profile_ids: Vec<ProfileId>,
    pub schedule: ScheduleConfig,
    pub filter: FilterConfig,
    pub options: OptionsConfig,
    pub state: CampaignState,
    pub pause_reason: Option<PauseReason>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Run number, incremented on every (re)arm of a recurring campaign
    pub run: i32,
    /// Seed for randomized candidate order in the current run
    pub run_seed: i64,
    /// Estimated recipients for the current run
    pub total_recipients: i64,
    pub counters: CampaignCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Calculate progress percentage
    pub fn progress_percentage(&self) -> f64 {
        if self.total_recipients <= 0 {
            0.0
        } else {
            let done = self.counters.sent + self.counters.failed + self.counters.skipped;
            (done as f64 / self.total_recipients as f64 * 100.0).min(100.0)
        }
    }
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub owner_id: TenantId,
    pub name: String,
    pub template_id: TemplateId,
    pub group_id: GroupId,
    pub campaign_type: CampaignType,
    pub target: MessengerTarget,
    pub profile_ids: Vec<ProfileId>,
    pub schedule: ScheduleConfig,
    pub filter: FilterConfig,
    pub options: OptionsConfig,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewCampaign {
    /// Materialize a DRAFT campaign
    pub fn into_campaign(self, id: CampaignId, now: DateTime<Utc>) -> Campaign {
        Campaign {
            id,
            owner_id: self.owner_id,
            name: self.name,
            template_id: self.template_id,
            group_id: self.group_id,
            campaign_type: self.campaign_type,
            target: self.target,
            profile_ids: self.profile_ids,
            schedule: self.schedule,
            filter: self.filter,
            options: self.options,
            state: CampaignState::Draft,
            pause_reason: None,
            scheduled_at: self.scheduled_at,
            run: 0,
            run_seed: 0,
            total_recipients: 0,
            counters: CampaignCounters::default(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Requested campaign state change, applied only from an expected state
#[derive(Debug, Clone)]
pub struct StateChange {
    pub from: Vec<CampaignState>,
    pub to: CampaignState,
    pub reason: TransitionReason,
    pub detail: Option<String>,
    /// Stored with the new state; cleared when `None`
    pub pause_reason: Option<PauseReason>,
    /// Replaces the scheduled start when set
    pub scheduled_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl StateChange {
    pub fn new(
        from: &[CampaignState],
        to: CampaignState,
        reason: TransitionReason,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            from: from.to_vec(),
            to,
            reason,
            detail: None,
            pause_reason: None,
            scheduled_at: None,
            at,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_pause_reason(mut self, reason: PauseReason) -> Self {
        self.pause_reason = Some(reason);
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Whether `campaign` may take this change
    pub fn applies_to(&self, campaign: &Campaign) -> bool {
        self.from.contains(&campaign.state) && campaign.state.can_transition_to(self.to)
    }

    /// Apply to an in-memory campaign, returning the transition record
    pub fn apply(&self, campaign: &mut Campaign) -> CampaignTransition {
        let record = CampaignTransition {
            campaign_id: campaign.id,
            from_state: campaign.state,
            to_state: self.to,
            reason: self.reason.to_string(),
            detail: self.detail.clone(),
            at: self.at,
        };
        campaign.state = self.to;
        campaign.pause_reason = self.pause_reason;
        if let Some(at) = self.scheduled_at {
            campaign.scheduled_at = Some(at);
        }
        if self.to.is_terminal() {
            campaign.completed_at = Some(self.at);
        }
        campaign.updated_at = self.at;
        record
    }
}

/// Recorded campaign state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignTransition {
    pub campaign_id: CampaignId,
    pub from_state: CampaignState,
    pub to_state: CampaignState,
    pub reason: String,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Dispatch message status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Skipped,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Sent | MessageStatus::Failed | MessageStatus::Skipped
        )
    }

    /// Allowed message transitions; PROCESSING -> PENDING is a requeue
    pub fn can_transition_to(&self, to: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Skipped)
                | (Processing, Sent)
                | (Processing, Failed)
                | (Processing, Pending)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Pending => write!(f, "pending"),
            MessageStatus::Processing => write!(f, "processing"),
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Failed => write!(f, "failed"),
            MessageStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "processing" => Ok(MessageStatus::Processing),
            "sent" => Ok(MessageStatus::Sent),
            "failed" => Ok(MessageStatus::Failed),
            "skipped" => Ok(MessageStatus::Skipped),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

/// Dispatch message model: one delivery of the campaign payload to one
/// client identifier on one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub campaign_id: CampaignId,
    pub run: i32,
    pub client_id: ClientId,
    /// Profile of the latest claim
    pub profile_id: Option<ProfileId>,
    pub channel: Channel,
    pub phone: String,
    /// Position within the client's channel plan
    pub step: i16,
    pub status: MessageStatus,
    pub attempts: i32,
    /// Payload items already delivered
    pub items_sent: i32,
    /// Engine instance of the latest claim
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub archived: bool,
}

/// Create message input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub campaign_id: CampaignId,
    pub run: i32,
    pub client_id: ClientId,
    pub channel: Channel,
    pub phone: String,
    pub step: i16,
}

/// Message counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl MessageCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.sent + self.failed + self.skipped
    }

    pub fn finished(&self) -> i64 {
        self.sent + self.failed + self.skipped
    }

    pub fn counters(&self) -> CampaignCounters {
        CampaignCounters {
            sent: self.sent,
            failed: self.failed,
            skipped: self.skipped,
            remaining: self.pending + self.processing,
        }
    }
}

/// Recipient (client directory entry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub phone: String,
    pub region: Option<String>,
    pub status: String,
    pub whatsapp_status: ChannelStatus,
    pub telegram_status: ChannelStatus,
    pub last_campaign_at: Option<DateTime<Utc>>,
    pub campaign_count: i32,
    pub created_at: DateTime<Utc>,
}

impl Client {
    pub fn channel_status(&self, channel: Channel) -> ChannelStatus {
        match channel {
            Channel::Whatsapp => self.whatsapp_status,
            Channel::Telegram => self.telegram_status,
        }
    }

    /// Attribute filters; deduplication and cooldown are applied separately
    pub fn matches(&self, filter: &FilterConfig) -> bool {
        if !filter.regions.is_empty()
            && !self
                .region
                .as_ref()
                .is_some_and(|r| filter.regions.contains(r))
        {
            return false;
        }
        if !filter.client_statuses.is_empty() && !filter.client_statuses.contains(&self.status) {
            return false;
        }
        if !filter.whatsapp_status.is_empty() && !filter.whatsapp_status.contains(&self.whatsapp_status)
        {
            return false;
        }
        if !filter.telegram_status.is_empty() && !filter.telegram_status.contains(&self.telegram_status)
        {
            return false;
        }
        if filter.never_campaigned && self.last_campaign_at.is_some() {
            return false;
        }
        if let Some(before) = filter.last_campaign_before {
            if !self.last_campaign_at.is_some_and(|at| at < before) {
                return false;
            }
        }
        if let Some(after) = filter.last_campaign_after {
            if !self.last_campaign_at.is_some_and(|at| at > after) {
                return false;
            }
        }
        if let Some(max) = filter.max_campaign_count {
            if self.campaign_count > max {
                return false;
            }
        }
        true
    }
}

/// Pagination cursor over a group in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCursor {
    pub created_at: DateTime<Utc>,
    pub id: ClientId,
}

impl From<&Client> for ClientCursor {
    fn from(client: &Client) -> Self {
        Self {
            created_at: client.created_at,
            id: client.id,
        }
    }
}

/// Persisted profile runtime state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileState {
    pub profile_id: ProfileId,
    pub availability: Availability,
    pub first_used_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl ProfileState {
    /// Whole days since the profile's first send
    pub fn warm_age_days(&self, now: DateTime<Utc>) -> i64 {
        self.first_used_at
            .map(|first| (now - first).num_days().max(0))
            .unwrap_or(0)
    }
}

/// One item of a message template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateItem {
    pub kind: String,
    pub content: serde_json::Value,
}

/// Template content as consumed by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub items: Vec<TemplateItem>,
}
