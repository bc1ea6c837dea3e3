//! Warmup caps: operator age-based limits and per-campaign ramps

use std::time::Duration;

/// Operator warmup: reduced daily caps for young profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupPolicy {
    pub enabled: bool,
    pub day1_to_3_limit: u32,
    pub day4_to_7_limit: u32,
}

impl WarmupPolicy {
    /// Daily cap for a profile on its `warm_day`-th day of use (first day = 1)
    pub fn daily_cap(&self, warm_day: i64) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        match warm_day {
            d if d <= 3 => Some(self.day1_to_3_limit),
            d if d <= 7 => Some(self.day4_to_7_limit),
            _ => None,
        }
    }
}

/// Campaign ramp: hourly cap rising linearly from `start_rate` to
/// `target_rate` over `ramp_hours` of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignRamp {
    pub start_rate: u32,
    pub target_rate: u32,
    pub ramp_hours: u32,
}

impl CampaignRamp {
    pub fn hourly_cap(&self, since_start: Duration) -> u32 {
        let ramp = Duration::from_secs(u64::from(self.ramp_hours) * 3_600);
        if ramp.is_zero() || since_start >= ramp {
            return self.target_rate;
        }
        let progress = since_start.as_secs_f64() / ramp.as_secs_f64();
        let start = f64::from(self.start_rate);
        let target = f64::from(self.target_rate);
        (start + (target - start) * progress).floor().max(1.0) as u32
    }
}
