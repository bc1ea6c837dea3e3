//! Profile ordering for assignment

use chrono::{DateTime, Utc};
use courier_common::types::ProfileId;

/// Round-robin cursor over a campaign's profiles
#[derive(Debug, Default)]
pub(crate) struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    /// Profiles in the order they should be tried: least recently used
    /// successful send first, ties broken by round-robin position
    pub fn order<F>(&self, profiles: &[ProfileId], last_success: F) -> Vec<ProfileId>
    where
        F: Fn(ProfileId) -> Option<DateTime<Utc>>,
    {
        order_profiles(profiles, self.cursor, last_success)
    }

    /// Move the cursor past the profile just used
    pub fn advance_past(&mut self, profiles: &[ProfileId], used: ProfileId) {
        if let Some(pos) = profiles.iter().position(|p| *p == used) {
            self.cursor = (pos + 1) % profiles.len().max(1);
        }
    }
}

pub fn order_profiles<F>(profiles: &[ProfileId], cursor: usize, last_success: F) -> Vec<ProfileId>
where
    F: Fn(ProfileId) -> Option<DateTime<Utc>>,
{
    if profiles.is_empty() {
        return Vec::new();
    }
    let start = cursor % profiles.len();
    let mut rotated: Vec<ProfileId> = profiles[start..]
        .iter()
        .chain(profiles[..start].iter())
        .copied()
        .collect();
    // Stable: equal keys keep round-robin order; never-used profiles first
    rotated.sort_by_key(|p| last_success(*p));
    rotated
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn test_round_robin_without_history() {
        let profiles = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let mut rr = RoundRobin::default();
        assert_eq!(rr.order(&profiles, |_| None), profiles);

        rr.advance_past(&profiles, profiles[0]);
        assert_eq!(
            rr.order(&profiles, |_| None),
            vec![profiles[1], profiles[2], profiles[0]]
        );

        rr.advance_past(&profiles, profiles[2]);
        assert_eq!(rr.order(&profiles, |_| None), profiles);
    }

    #[test]
    fn test_least_recently_used_first() {
        let profiles = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let now = Utc::now();
        let history = HashMap::from([
            (profiles[0], now),
            (profiles[1], now - Duration::minutes(5)),
        ]);
        let ordered = order_profiles(&profiles, 0, |p| history.get(&p).copied());
        assert_eq!(ordered, vec![profiles[2], profiles[1], profiles[0]]);
    }

    #[test]
    fn test_empty() {
        assert!(order_profiles(&[], 3, |_| None).is_empty());
    }
}
