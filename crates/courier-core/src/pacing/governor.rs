//! Pacing governor - per-profile rolling caps and send spacing
//!
//! One governor is shared by every campaign in the process, so a profile
//! used by several campaigns is paced as a whole.

use chrono::{DateTime, Duration, Utc};
use courier_common::types::ProfileId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

const HOUR: Duration = Duration::hours(1);
const DAY: Duration = Duration::days(1);

/// Effective caps for one profile in one campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingLimits {
    pub hourly: u32,
    pub daily: u32,
}

/// Result of a capacity request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Granted(Permit),
    /// No capacity until `retry_at`
    Denied { retry_at: DateTime<Utc> },
}

/// Reserved send slot; must be settled once the send finishes
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a permit must be settled"]
pub struct Permit {
    pub profile_id: ProfileId,
    reserved_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ProfileWindow {
    hour: VecDeque<DateTime<Utc>>,
    day: VecDeque<DateTime<Utc>>,
    next_send_at: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    seeded: bool,
}

impl ProfileWindow {
    fn evict(&mut self, now: DateTime<Utc>) {
        while self.hour.front().is_some_and(|at| *at <= now - HOUR) {
            self.hour.pop_front();
        }
        while self.day.front().is_some_and(|at| *at <= now - DAY) {
            self.day.pop_front();
        }
    }

    fn record(&mut self, at: DateTime<Utc>) {
        self.hour.push_back(at);
        self.day.push_back(at);
    }

    fn forget(&mut self, at: DateTime<Utc>) {
        if let Some(pos) = self.hour.iter().rposition(|t| *t == at) {
            self.hour.remove(pos);
        }
        if let Some(pos) = self.day.iter().rposition(|t| *t == at) {
            self.day.remove(pos);
        }
    }
}

/// Process-wide pacing state
#[derive(Debug, Default)]
pub struct PacingGovernor {
    profiles: Mutex<HashMap<ProfileId, ProfileWindow>>,
}

impl PacingGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    fn windows(&self) -> std::sync::MutexGuard<'_, HashMap<ProfileId, ProfileWindow>> {
        self.profiles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking capacity check. A grant reserves one slot in both
    /// rolling windows until settled.
    pub fn try_acquire(
        &self,
        profile_id: ProfileId,
        limits: PacingLimits,
        now: DateTime<Utc>,
    ) -> Acquire {
        let mut windows = self.windows();
        let window = windows.entry(profile_id).or_default();
        window.evict(now);

        if let Some(next) = window.next_send_at {
            if now < next {
                return Acquire::Denied { retry_at: next };
            }
        }

        let mut retry_at: Option<DateTime<Utc>> = None;
        if window.hour.len() >= limits.hourly as usize {
            let free = window
                .hour
                .iter()
                .rev()
                .nth(limits.hourly.saturating_sub(1) as usize)
                .map_or(now + HOUR, |at| *at + HOUR);
            retry_at = Some(free);
        }
        if window.day.len() >= limits.daily as usize {
            let free = window
                .day
                .iter()
                .rev()
                .nth(limits.daily.saturating_sub(1) as usize)
                .map_or(now + DAY, |at| *at + DAY);
            retry_at = Some(retry_at.map_or(free, |r| r.max(free)));
        }
        if let Some(retry_at) = retry_at {
            debug!(
                profile_id = %profile_id,
                hour = window.hour.len(),
                day = window.day.len(),
                "Pacing cap reached"
            );
            return Acquire::Denied { retry_at };
        }

        window.record(now);
        Acquire::Granted(Permit {
            profile_id,
            reserved_at: now,
        })
    }

    /// Settle a permit: keep the slot for a successful send (moved to the
    /// send time), release it otherwise, and space the next send by `spacing`
    pub fn settle(&self, permit: Permit, sent: bool, now: DateTime<Utc>, spacing: Duration) {
        let mut windows = self.windows();
        let window = windows.entry(permit.profile_id).or_default();
        window.forget(permit.reserved_at);
        if sent {
            window.record(now);
            window.last_success = Some(now);
        }
        window.next_send_at = Some(now + spacing);
    }

    /// Return a permit that was never used for a send
    pub fn release(&self, permit: Permit) {
        let mut windows = self.windows();
        if let Some(window) = windows.get_mut(&permit.profile_id) {
            window.forget(permit.reserved_at);
        }
    }

    /// Load persisted send history once per profile after a restart
    pub fn seed(&self, profile_id: ProfileId, sent_at: &[DateTime<Utc>], now: DateTime<Utc>) {
        let mut windows = self.windows();
        let window = windows.entry(profile_id).or_default();
        if window.seeded {
            return;
        }
        window.seeded = true;

        let mut history: Vec<DateTime<Utc>> = sent_at
            .iter()
            .copied()
            .filter(|at| *at > now - DAY && *at <= now)
            .collect();
        history.sort();
        for at in history {
            window.record(at);
            window.last_success = Some(window.last_success.map_or(at, |l| l.max(at)));
        }
        window.evict(now);
    }

    pub fn is_seeded(&self, profile_id: ProfileId) -> bool {
        self.windows().get(&profile_id).is_some_and(|w| w.seeded)
    }

    /// Time of the profile's latest successful send
    pub fn last_success(&self, profile_id: ProfileId) -> Option<DateTime<Utc>> {
        self.windows().get(&profile_id).and_then(|w| w.last_success)
    }

    /// Sends counted in the rolling hour and day windows
    pub fn usage(&self, profile_id: ProfileId, now: DateTime<Utc>) -> (usize, usize) {
        let mut windows = self.windows();
        match windows.get_mut(&profile_id) {
            Some(window) => {
                window.evict(now);
                (window.hour.len(), window.day.len())
            }
            None => (0, 0),
        }
    }
}
