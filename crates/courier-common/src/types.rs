//! Common types for Courier

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tenants (campaign owners)
pub type TenantId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for clients (recipients)
pub type ClientId = Uuid;

/// Unique identifier for recipient groups
pub type GroupId = Uuid;

/// Unique identifier for messaging profiles
pub type ProfileId = Uuid;

/// Unique identifier for dispatch messages
pub type MessageId = Uuid;

/// Unique identifier for message templates
pub type TemplateId = Uuid;

/// Messaging channel a profile sends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Whatsapp,
    Telegram,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Whatsapp => write!(f, "whatsapp"),
            Channel::Telegram => write!(f, "telegram"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Channel::Whatsapp),
            "telegram" => Ok(Channel::Telegram),
            _ => Err(crate::Error::Validation(format!("Invalid channel: {}", s))),
        }
    }
}

/// Validity of a client's identifier on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Valid,
    Invalid,
    #[default]
    Unknown,
}

impl ChannelStatus {
    /// Whether a send may be attempted on this channel
    pub fn is_sendable(&self) -> bool {
        !matches!(self, ChannelStatus::Invalid)
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Valid => write!(f, "valid"),
            ChannelStatus::Invalid => write!(f, "invalid"),
            ChannelStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for ChannelStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(ChannelStatus::Valid),
            "invalid" => Ok(ChannelStatus::Invalid),
            "unknown" => Ok(ChannelStatus::Unknown),
            _ => Err(crate::Error::Validation(format!(
                "Invalid channel status: {}",
                s
            ))),
        }
    }
}

/// Serialization discipline between sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseMode {
    /// One in-flight message per profile
    #[default]
    BetweenNumbers,
    /// Additionally one in-flight message per client across all profiles
    BetweenClients,
}

/// Campaign type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignType {
    #[default]
    OneTime,
    Scheduled,
}

impl std::fmt::Display for CampaignType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignType::OneTime => write!(f, "one_time"),
            CampaignType::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl std::str::FromStr for CampaignType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(CampaignType::OneTime),
            "scheduled" => Ok(CampaignType::Scheduled),
            _ => Err(crate::Error::Validation(format!("Invalid campaign type: {}", s))),
        }
    }
}

/// Channel ordering for universal campaigns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UniversalOrder {
    Both,
    WhatsappFirst,
    TelegramFirst,
}

/// Which messengers a campaign targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessengerTarget {
    WhatsappOnly,
    TelegramOnly,
    Universal { order: UniversalOrder },
}

impl Default for MessengerTarget {
    fn default() -> Self {
        MessengerTarget::WhatsappOnly
    }
}

impl MessengerTarget {
    /// Channels in the order they are attempted for one client
    pub fn channels(&self) -> &'static [Channel] {
        match self {
            MessengerTarget::WhatsappOnly => &[Channel::Whatsapp],
            MessengerTarget::TelegramOnly => &[Channel::Telegram],
            MessengerTarget::Universal {
                order: UniversalOrder::Both | UniversalOrder::WhatsappFirst,
            } => &[Channel::Whatsapp, Channel::Telegram],
            MessengerTarget::Universal {
                order: UniversalOrder::TelegramFirst,
            } => &[Channel::Telegram, Channel::Whatsapp],
        }
    }

    /// Whether later channels are only used when earlier ones fail
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            MessengerTarget::Universal {
                order: UniversalOrder::WhatsappFirst | UniversalOrder::TelegramFirst
            }
        )
    }

    pub fn is_universal(&self) -> bool {
        matches!(self, MessengerTarget::Universal { .. })
    }
}

/// Campaign recurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recurrence {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    /// Next occurrence after `at`, if the campaign recurs
    pub fn next_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::None => None,
            Recurrence::Daily => Some(at + chrono::Duration::days(1)),
            Recurrence::Weekly => Some(at + chrono::Duration::days(7)),
            Recurrence::Monthly => at.checked_add_months(Months::new(1)),
        }
    }
}

/// Availability of a messaging profile as reported by its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Availability {
    #[default]
    Available,
    Busy,
    Unhealthy,
    Stopped,
}

impl Availability {
    /// Whether the profile is out of service (as opposed to momentarily busy)
    pub fn is_down(&self) -> bool {
        matches!(self, Availability::Unhealthy | Availability::Stopped)
    }
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Availability::Available => write!(f, "available"),
            Availability::Busy => write!(f, "busy"),
            Availability::Unhealthy => write!(f, "unhealthy"),
            Availability::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for Availability {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Ok(Availability::Available),
            "busy" => Ok(Availability::Busy),
            "unhealthy" => Ok(Availability::Unhealthy),
            "stopped" => Ok(Availability::Stopped),
            _ => Err(crate::Error::Validation(format!("Invalid availability: {}", s))),
        }
    }
}

/// Campaign schedule (work hours, work days, recurrence)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub work_hours_enabled: bool,

    /// Window start, "HH:MM"
    pub work_hours_start: Option<String>,

    /// Window end, "HH:MM" (exclusive)
    pub work_hours_end: Option<String>,

    #[serde(default)]
    pub work_days_enabled: bool,

    /// ISO weekdays, 1 = Monday .. 7 = Sunday
    #[serde(default)]
    pub work_days: Vec<u8>,

    #[serde(default)]
    pub recurrence: Recurrence,

    pub recurrence_end_date: Option<DateTime<Utc>>,

    /// IANA timezone name; falls back to the global timezone
    pub timezone: Option<String>,
}

/// Recipient filter rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub regions: Vec<String>,

    #[serde(default)]
    pub client_statuses: Vec<String>,

    #[serde(default)]
    pub whatsapp_status: Vec<ChannelStatus>,

    #[serde(default)]
    pub telegram_status: Vec<ChannelStatus>,

    pub last_campaign_before: Option<DateTime<Utc>>,

    pub last_campaign_after: Option<DateTime<Utc>>,

    #[serde(default)]
    pub never_campaigned: bool,

    pub max_campaign_count: Option<i32>,

    /// Truncate the candidate list to this many clients
    pub contact_limit: Option<u32>,

    #[serde(default)]
    pub random_order: bool,
}

/// Deduplication against earlier campaigns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupOptions {
    pub enabled: bool,
    pub period_days: u32,
    /// Additional campaigns whose sends count as duplicates
    #[serde(default)]
    pub campaign_ids: Vec<CampaignId>,
}

/// Cooldown after any send to a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CooldownOptions {
    pub enabled: bool,
    pub minutes: u32,
}

/// Per-campaign warmup ramp (contacts per hour per profile)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmupOptions {
    pub enabled: bool,
    pub start_rate: u32,
    pub target_rate: u32,
    pub ramp_hours: u32,
}

/// Per-campaign risk options; unset fields fall back to global settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionsConfig {
    pub deduplication: Option<DedupOptions>,
    pub cooldown: Option<CooldownOptions>,
    pub warmup: Option<WarmupOptions>,
    pub auto_resume: Option<bool>,
    pub stop_on_error_count: Option<u32>,
    pub stop_on_consecutive_errors: Option<u32>,
}
