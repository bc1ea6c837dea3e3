//! Operator settings: process-wide defaults and per-tenant limits

use crate::types::{PauseMode, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide dispatch settings, mutable by the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub pause_mode: PauseMode,

    pub min_delay_between_contacts_ms: u64,
    pub max_delay_between_contacts_ms: u64,
    pub min_delay_between_messages_ms: u64,
    pub max_delay_between_messages_ms: u64,

    /// Per-profile contact caps
    pub max_contacts_per_hour: u32,
    pub max_contacts_per_day: u32,

    /// Defaults offered to new campaigns
    pub default_work_hours_start: String,
    pub default_work_hours_end: String,
    pub default_work_days: Vec<u8>,
    pub timezone: String,

    pub typing_simulation_enabled: bool,
    /// Characters per minute
    pub typing_speed_cpm: u32,

    pub max_retries_on_error: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff_multiplier: f64,

    pub pause_on_critical_error: bool,
    pub stop_on_consecutive_errors: u32,
    pub stop_on_error_threshold: u32,

    pub profile_health_check_interval_ms: u64,
    pub auto_resume_after_restart: bool,
    pub campaign_retention_days: u32,

    pub warmup_enabled: bool,
    pub warmup_day1_to_3_limit: u32,
    pub warmup_day4_to_7_limit: u32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            pause_mode: PauseMode::BetweenNumbers,
            min_delay_between_contacts_ms: 30_000,
            max_delay_between_contacts_ms: 90_000,
            min_delay_between_messages_ms: 2_000,
            max_delay_between_messages_ms: 5_000,
            max_contacts_per_hour: 30,
            max_contacts_per_day: 200,
            default_work_hours_start: "09:00".to_string(),
            default_work_hours_end: "18:00".to_string(),
            default_work_days: vec![1, 2, 3, 4, 5],
            timezone: "UTC".to_string(),
            typing_simulation_enabled: true,
            typing_speed_cpm: 300,
            max_retries_on_error: 3,
            retry_delay_ms: 60_000,
            retry_backoff_multiplier: 2.0,
            pause_on_critical_error: true,
            stop_on_consecutive_errors: 3,
            stop_on_error_threshold: 10,
            profile_health_check_interval_ms: 60_000,
            auto_resume_after_restart: true,
            campaign_retention_days: 90,
            warmup_enabled: true,
            warmup_day1_to_3_limit: 20,
            warmup_day4_to_7_limit: 50,
        }
    }
}

impl GlobalSettings {
    /// Validate internal consistency
    pub fn validate(&self) -> crate::Result<()> {
        if self.min_delay_between_contacts_ms > self.max_delay_between_contacts_ms {
            return Err(crate::Error::Validation(
                "min_delay_between_contacts_ms exceeds max_delay_between_contacts_ms".to_string(),
            ));
        }
        if self.min_delay_between_messages_ms > self.max_delay_between_messages_ms {
            return Err(crate::Error::Validation(
                "min_delay_between_messages_ms exceeds max_delay_between_messages_ms".to_string(),
            ));
        }
        // Retry delays must strictly increase from one attempt to the next
        if self.retry_delay_ms == 0 {
            return Err(crate::Error::Validation(
                "retry_delay_ms must be positive".to_string(),
            ));
        }
        if self.retry_backoff_multiplier.is_nan() || self.retry_backoff_multiplier <= 1.0 {
            return Err(crate::Error::Validation(
                "retry_backoff_multiplier must be greater than 1.0".to_string(),
            ));
        }
        if self.profile_health_check_interval_ms == 0 {
            return Err(crate::Error::Validation(
                "profile_health_check_interval_ms must be positive".to_string(),
            ));
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(crate::Error::Validation(format!(
                "Unknown timezone: {}",
                self.timezone
            )));
        }
        Ok(())
    }
}

/// A global settings snapshot with its persistence version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedSettings {
    pub version: i64,
    pub settings: GlobalSettings,
    pub updated_at: DateTime<Utc>,
}

impl VersionedSettings {
    pub fn initial(settings: GlobalSettings) -> Self {
        Self {
            version: 0,
            settings,
            updated_at: Utc::now(),
        }
    }
}

/// Per-tenant campaign limits, enforced at activation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCampaignLimits {
    pub user_id: TenantId,
    pub max_active_campaigns: Option<u32>,
    pub max_templates: Option<u32>,
    pub max_template_categories: Option<u32>,
    pub max_file_size_bytes: Option<u64>,
    pub max_total_storage_bytes: Option<u64>,
    #[serde(default = "default_true")]
    pub allow_scheduled: bool,
    #[serde(default = "default_true")]
    pub allow_universal_target: bool,
    /// Tenant-level override of the per-profile caps (tighter wins)
    pub max_contacts_per_hour: Option<u32>,
    pub max_contacts_per_day: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl UserCampaignLimits {
    /// Limits that allow everything
    pub fn unrestricted(user_id: TenantId) -> Self {
        Self {
            user_id,
            max_active_campaigns: None,
            max_templates: None,
            max_template_categories: None,
            max_file_size_bytes: None,
            max_total_storage_bytes: None,
            allow_scheduled: true,
            allow_universal_target: true,
            max_contacts_per_hour: None,
            max_contacts_per_day: None,
        }
    }
}
