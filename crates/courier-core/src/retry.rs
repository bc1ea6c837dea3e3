//! Error/retry policy for send outcomes

use crate::executor::SendOutcome;
use courier_common::types::ProfileId;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::warn;

/// Retry schedule for transient failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

/// What happens to a message after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Mark SENT
    Complete,
    /// Back to PENDING, eligible again after the delay
    Retry { after: Duration },
    /// Mark FAILED
    Fail,
}

impl RetryPolicy {
    /// Delay before the `retry`-th retry (first retry = 1)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(30) as i32;
        self.base_delay.mul_f64(self.multiplier.max(1.0).powi(exponent))
    }

    /// Decide the next step for a message that has been attempted
    /// `attempts` times, the last one ending in `outcome`
    pub fn decide(&self, outcome: SendOutcome, attempts: u32) -> RetryDecision {
        match outcome {
            SendOutcome::Sent => RetryDecision::Complete,
            SendOutcome::PermanentFailure => RetryDecision::Fail,
            SendOutcome::TransientFailure | SendOutcome::CriticalFailure(_) => {
                if attempts <= self.max_retries {
                    RetryDecision::Retry {
                        after: self.delay_for(attempts),
                    }
                } else {
                    RetryDecision::Fail
                }
            }
        }
    }
}

/// Thresholds for critical profile errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriticalPolicy {
    pub pause_on_critical_error: bool,
    /// Consecutive critical errors on one profile before it is suspended
    pub consecutive_threshold: u32,
    /// Critical errors across the whole run before the campaign pauses
    pub campaign_threshold: u32,
}

/// Reaction to a critical error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalAction {
    Continue,
    /// Stop issuing sends on this profile
    SuspendProfile,
    /// Pause the whole campaign
    PauseCampaign,
}

/// Critical error bookkeeping for one campaign run
#[derive(Debug)]
pub struct ErrorTracker {
    policy: CriticalPolicy,
    profiles: Vec<ProfileId>,
    consecutive: HashMap<ProfileId, u32>,
    total: u32,
    suspended: HashSet<ProfileId>,
}

impl ErrorTracker {
    pub fn new(policy: CriticalPolicy, profiles: Vec<ProfileId>) -> Self {
        Self {
            policy,
            profiles,
            consecutive: HashMap::new(),
            total: 0,
            suspended: HashSet::new(),
        }
    }

    pub fn set_policy(&mut self, policy: CriticalPolicy) {
        self.policy = policy;
    }

    pub fn record_success(&mut self, profile_id: ProfileId) {
        self.consecutive.remove(&profile_id);
    }

    pub fn record_critical(&mut self, profile_id: ProfileId) -> CriticalAction {
        let consecutive = self.consecutive.entry(profile_id).or_insert(0);
        *consecutive += 1;
        let consecutive = *consecutive;
        self.total += 1;

        if !self.policy.pause_on_critical_error {
            return CriticalAction::Continue;
        }

        if self.policy.campaign_threshold > 0 && self.total >= self.policy.campaign_threshold {
            warn!(
                total = self.total,
                threshold = self.policy.campaign_threshold,
                "Campaign critical error threshold reached"
            );
            return CriticalAction::PauseCampaign;
        }

        if self.policy.consecutive_threshold > 0 && consecutive >= self.policy.consecutive_threshold
        {
            self.suspended.insert(profile_id);
            warn!(
                profile_id = %profile_id,
                consecutive,
                "Profile suspended after consecutive critical errors"
            );
            if self.profiles.iter().all(|p| self.suspended.contains(p)) {
                return CriticalAction::PauseCampaign;
            }
            return CriticalAction::SuspendProfile;
        }

        CriticalAction::Continue
    }

    pub fn is_suspended(&self, profile_id: ProfileId) -> bool {
        self.suspended.contains(&profile_id)
    }

    /// Make a suspended profile eligible again
    pub fn reinstate(&mut self, profile_id: ProfileId) -> bool {
        self.consecutive.remove(&profile_id);
        self.suspended.remove(&profile_id)
    }

    /// Forget all counters, used when the campaign is resumed
    pub fn clear(&mut self) {
        self.consecutive.clear();
        self.suspended.clear();
        self.total = 0;
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}
