//! Settings resolution
//!
//! Global settings, tenant limits and campaign configuration are merged
//! into an immutable [`EffectivePolicy`] once per run, and again only when
//! the operator saves new global settings.

mod limits;
mod resolver;

pub use limits::{check_activation, LimitViolation};

use crate::executor::TypingSimulation;
use crate::pacing::{CampaignRamp, DelayRange, PacingLimits, WarmupPolicy};
use crate::retry::{CriticalPolicy, RetryPolicy};
use crate::window::WorkWindow;
use courier_common::types::{CampaignId, PauseMode};
use courier_common::VersionedSettings;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Current global settings snapshot, replaced whole on every save
pub type SettingsWatch = watch::Receiver<Arc<VersionedSettings>>;

/// Malformed or incomplete campaign policy; raised at activation only
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} is required when {condition}")]
    MissingField {
        field: &'static str,
        condition: &'static str,
    },

    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Deduplication scope for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupPolicy {
    pub period: chrono::Duration,
    /// Campaigns whose sends exclude a client; always includes the campaign itself
    pub campaign_ids: Vec<CampaignId>,
}

/// Resolved policy snapshot for one campaign run
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub settings_version: i64,
    pub pause_mode: PauseMode,
    pub contact_delay: DelayRange,
    pub message_delay: DelayRange,
    /// Per-profile caps after tenant overrides
    pub max_contacts_per_hour: u32,
    pub max_contacts_per_day: u32,
    pub warmup: WarmupPolicy,
    pub ramp: Option<CampaignRamp>,
    pub window: WorkWindow,
    pub typing: Option<TypingSimulation>,
    pub retry: RetryPolicy,
    pub critical: CriticalPolicy,
    pub dedup: Option<DedupPolicy>,
    pub cooldown: Option<chrono::Duration>,
    pub auto_resume: bool,
    pub health_check_interval: Duration,
    pub retention_days: u32,
}

impl EffectivePolicy {
    /// Caps for a profile on its `warm_day`-th day of use, `since_start`
    /// into the run. Never above any of the global, tenant or warmup caps.
    pub fn limits_for(&self, warm_day: i64, since_start: Duration) -> PacingLimits {
        let mut hourly = self.max_contacts_per_hour;
        if let Some(ramp) = &self.ramp {
            hourly = hourly.min(ramp.hourly_cap(since_start));
        }

        let mut daily = self.max_contacts_per_day;
        if let Some(cap) = self.warmup.daily_cap(warm_day) {
            daily = daily.min(cap);
        }

        PacingLimits { hourly, daily }
    }
}
