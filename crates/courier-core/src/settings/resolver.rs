use super::{ConfigError, DedupPolicy, EffectivePolicy};
use crate::executor::TypingSimulation;
use crate::pacing::{CampaignRamp, DelayRange, WarmupPolicy};
use crate::retry::{CriticalPolicy, RetryPolicy};
use crate::window::{weekday_from_iso, WorkHours, WorkWindow};
use chrono::NaiveTime;
use chrono_tz::Tz;
use courier_common::types::{CampaignType, Recurrence, ScheduleConfig};
use courier_common::{GlobalSettings, UserCampaignLimits, VersionedSettings};
use courier_storage::Campaign;
use std::time::Duration;

impl EffectivePolicy {
    /// Merge operator settings, tenant limits and campaign configuration.
    ///
    /// Schedule values come from the campaign; unset options fall back to
    /// the global settings. Tenant caps only ever tighten global caps.
    pub fn resolve(
        settings: &VersionedSettings,
        limits: Option<&UserCampaignLimits>,
        campaign: &Campaign,
    ) -> Result<Self, ConfigError> {
        let global = &settings.settings;
        global
            .validate()
            .map_err(|e| ConfigError::InvalidValue {
                field: "global_settings",
                reason: e.to_string(),
            })?;

        if campaign.profile_ids.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "profile_ids",
                reason: "at least one profile must be assigned".to_string(),
            });
        }
        if campaign.campaign_type == CampaignType::Scheduled && campaign.scheduled_at.is_none() {
            return Err(ConfigError::MissingField {
                field: "scheduled_at",
                condition: "the campaign type is SCHEDULED",
            });
        }

        let window = resolve_window(&campaign.schedule, global)?;
        if campaign.schedule.recurrence != Recurrence::None && campaign.scheduled_at.is_none() {
            return Err(ConfigError::MissingField {
                field: "scheduled_at",
                condition: "recurrence is set",
            });
        }

        let options = &campaign.options;
        let warmup_enabled = options
            .warmup
            .as_ref()
            .map_or(global.warmup_enabled, |w| w.enabled);

        let ramp = match &options.warmup {
            Some(warmup) if warmup.enabled => {
                if warmup.ramp_hours == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "options.warmup.ramp_hours",
                        reason: "must be positive".to_string(),
                    });
                }
                if warmup.target_rate == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "options.warmup.target_rate",
                        reason: "must be positive".to_string(),
                    });
                }
                Some(CampaignRamp {
                    start_rate: warmup.start_rate.max(1),
                    target_rate: warmup.target_rate,
                    ramp_hours: warmup.ramp_hours,
                })
            }
            _ => None,
        };

        let dedup = match &options.deduplication {
            Some(dedup) if dedup.enabled => {
                if dedup.period_days == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "options.deduplication.period_days",
                        reason: "must be positive".to_string(),
                    });
                }
                let mut campaign_ids = vec![campaign.id];
                for id in &dedup.campaign_ids {
                    if !campaign_ids.contains(id) {
                        campaign_ids.push(*id);
                    }
                }
                Some(DedupPolicy {
                    period: chrono::Duration::days(i64::from(dedup.period_days)),
                    campaign_ids,
                })
            }
            _ => None,
        };

        let cooldown = match &options.cooldown {
            Some(cooldown) if cooldown.enabled => {
                if cooldown.minutes == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "options.cooldown.minutes",
                        reason: "must be positive".to_string(),
                    });
                }
                Some(chrono::Duration::minutes(i64::from(cooldown.minutes)))
            }
            _ => None,
        };

        let tenant_hour = limits.and_then(|l| l.max_contacts_per_hour);
        let tenant_day = limits.and_then(|l| l.max_contacts_per_day);

        Ok(Self {
            settings_version: settings.version,
            pause_mode: global.pause_mode,
            contact_delay: DelayRange::new(
                global.min_delay_between_contacts_ms,
                global.max_delay_between_contacts_ms,
            ),
            message_delay: DelayRange::new(
                global.min_delay_between_messages_ms,
                global.max_delay_between_messages_ms,
            ),
            max_contacts_per_hour: tighter(global.max_contacts_per_hour, tenant_hour),
            max_contacts_per_day: tighter(global.max_contacts_per_day, tenant_day),
            warmup: WarmupPolicy {
                enabled: warmup_enabled,
                day1_to_3_limit: global.warmup_day1_to_3_limit,
                day4_to_7_limit: global.warmup_day4_to_7_limit,
            },
            ramp,
            window,
            typing: global.typing_simulation_enabled.then_some(TypingSimulation {
                speed_cpm: global.typing_speed_cpm,
            }),
            retry: RetryPolicy {
                max_retries: global.max_retries_on_error,
                base_delay: Duration::from_millis(global.retry_delay_ms),
                multiplier: global.retry_backoff_multiplier,
            },
            critical: CriticalPolicy {
                pause_on_critical_error: global.pause_on_critical_error,
                consecutive_threshold: options
                    .stop_on_consecutive_errors
                    .unwrap_or(global.stop_on_consecutive_errors),
                campaign_threshold: options
                    .stop_on_error_count
                    .unwrap_or(global.stop_on_error_threshold),
            },
            dedup,
            cooldown,
            auto_resume: options.auto_resume.unwrap_or(global.auto_resume_after_restart),
            health_check_interval: Duration::from_millis(global.profile_health_check_interval_ms),
            retention_days: global.campaign_retention_days,
        })
    }
}

fn tighter(global: u32, tenant: Option<u32>) -> u32 {
    tenant.map_or(global, |t| t.min(global))
}

fn resolve_window(
    schedule: &ScheduleConfig,
    global: &GlobalSettings,
) -> Result<WorkWindow, ConfigError> {
    let tz_name = schedule.timezone.as_deref().unwrap_or(&global.timezone);
    let timezone: Tz = tz_name.parse().map_err(|_| ConfigError::InvalidValue {
        field: "schedule.timezone",
        reason: format!("unknown timezone {}", tz_name),
    })?;

    let hours = if schedule.work_hours_enabled {
        let start = required_time(
            schedule.work_hours_start.as_deref(),
            "schedule.work_hours_start",
        )?;
        let end = required_time(schedule.work_hours_end.as_deref(), "schedule.work_hours_end")?;
        if start == end {
            return Err(ConfigError::InvalidValue {
                field: "schedule.work_hours_end",
                reason: "must differ from the start time".to_string(),
            });
        }
        Some(WorkHours { start, end })
    } else {
        None
    };

    let days = if schedule.work_days_enabled {
        if schedule.work_days.is_empty() {
            return Err(ConfigError::MissingField {
                field: "schedule.work_days",
                condition: "work_days_enabled is set",
            });
        }
        let mut days = Vec::with_capacity(schedule.work_days.len());
        for day in &schedule.work_days {
            let weekday = weekday_from_iso(*day).ok_or_else(|| ConfigError::InvalidValue {
                field: "schedule.work_days",
                reason: format!("{} is not an ISO weekday", day),
            })?;
            if !days.contains(&weekday) {
                days.push(weekday);
            }
        }
        Some(days)
    } else {
        None
    };

    Ok(WorkWindow {
        timezone,
        hours,
        days,
        recurrence_end: schedule.recurrence_end_date,
    })
}

fn required_time(value: Option<&str>, field: &'static str) -> Result<NaiveTime, ConfigError> {
    let value = value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingField {
            field,
            condition: "work_hours_enabled is set",
        })?;
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ConfigError::InvalidValue {
        field,
        reason: format!("{} is not HH:MM", value),
    })
}
