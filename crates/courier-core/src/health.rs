//! Profile health monitoring
//!
//! The monitor probes every profile assigned to an active campaign on the
//! operator's health-check interval. Availability changes are published on
//! the [`ProfileRegistry`] so running campaigns react without polling.

use crate::clock::Clock;
use crate::executor::HealthProbe;
use crate::notify::{Notification, Notifier};
use crate::settings::SettingsWatch;
use courier_common::types::{Availability, ProfileId};
use courier_common::Result;
use courier_storage::{CampaignState, Stores};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Availability change of one profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileEvent {
    pub profile_id: ProfileId,
    pub previous: Availability,
    pub current: Availability,
}

impl ProfileEvent {
    pub fn went_down(&self) -> bool {
        !self.previous.is_down() && self.current.is_down()
    }

    pub fn recovered(&self) -> bool {
        self.previous.is_down() && self.current == Availability::Available
    }
}

/// Last known availability of every profile, shared by all campaigns
pub struct ProfileRegistry {
    states: Mutex<HashMap<ProfileId, Availability>>,
    events: broadcast::Sender<ProfileEvent>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Unknown profiles are assumed available until probed
    pub fn availability(&self, profile_id: ProfileId) -> Availability {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&profile_id)
            .copied()
            .unwrap_or_default()
    }

    /// Record a probe result, publishing an event when it changed
    pub fn update(&self, profile_id: ProfileId, current: Availability) -> Option<ProfileEvent> {
        let previous = {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            states.insert(profile_id, current).unwrap_or_default()
        };
        if previous == current {
            return None;
        }
        let event = ProfileEvent {
            profile_id,
            previous,
            current,
        };
        // No subscribers is fine
        let _ = self.events.send(event);
        Some(event)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProfileEvent> {
        self.events.subscribe()
    }
}

/// Periodic profile prober
pub struct HealthMonitor {
    stores: Stores,
    probe: Arc<dyn HealthProbe>,
    registry: Arc<ProfileRegistry>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    settings: SettingsWatch,
}

impl HealthMonitor {
    pub fn new(
        stores: Stores,
        probe: Arc<dyn HealthProbe>,
        registry: Arc<ProfileRegistry>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        settings: SettingsWatch,
    ) -> Self {
        Self {
            stores,
            probe,
            registry,
            notifier,
            clock,
            settings,
        }
    }

    fn check_interval(&self) -> Duration {
        let ms = self.settings.borrow().settings.profile_health_check_interval_ms;
        Duration::from_millis(ms.max(1))
    }

    /// Probe every profile of every active campaign once; returns the
    /// number of availability changes
    pub async fn check_once(&self) -> Result<usize> {
        let campaigns = self
            .stores
            .campaigns
            .list_by_states(&[
                CampaignState::Queued,
                CampaignState::Running,
                CampaignState::Paused,
            ])
            .await?;
        let profiles: BTreeSet<ProfileId> = campaigns
            .iter()
            .flat_map(|c| c.profile_ids.iter().copied())
            .collect();

        let mut changes = 0;
        for profile_id in profiles {
            let availability = self.probe.check_profile_health(profile_id).await;
            let now = self.clock.now();
            if let Err(e) = self
                .stores
                .profiles
                .set_availability(profile_id, availability, now)
                .await
            {
                warn!(profile_id = %profile_id, "Failed to store availability: {}", e);
            }

            let Some(event) = self.registry.update(profile_id, availability) else {
                continue;
            };
            changes += 1;
            info!(
                profile_id = %profile_id,
                previous = %event.previous,
                current = %event.current,
                "Profile availability changed"
            );
            if event.went_down() {
                self.notifier.notify(Notification::ProfileIssue {
                    profile_id,
                    availability,
                });
            }
        }
        Ok(changes)
    }

    /// Run until cancelled
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut period = self.check_interval();
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut watching = true;
            info!(interval_ms = period.as_millis() as u64, "Health monitor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = self.settings.changed(), if watching => {
                        if changed.is_err() {
                            watching = false;
                            continue;
                        }
                        let next = self.check_interval();
                        if next != period {
                            debug!(interval_ms = next.as_millis() as u64, "Health check interval changed");
                            period = next;
                            ticker = interval(period);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.check_once().await {
                            error!("Health check cycle failed: {}", e);
                        }
                    }
                }
            }
            info!("Health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::testing::sample_new_campaign;
    use async_trait::async_trait;
    use courier_common::{GlobalSettings, VersionedSettings};
    use courier_storage::{CampaignRepository, MemoryStore, StateChange, TransitionReason};
    use tokio::sync::watch;

    struct Scripted {
        states: Mutex<HashMap<ProfileId, Availability>>,
    }

    #[async_trait]
    impl HealthProbe for Scripted {
        async fn check_profile_health(&self, profile_id: ProfileId) -> Availability {
            self.states
                .lock()
                .unwrap()
                .get(&profile_id)
                .copied()
                .unwrap_or(Availability::Available)
        }
    }

    #[test]
    fn test_registry_events() {
        let registry = ProfileRegistry::new();
        let mut events = registry.subscribe();
        let profile = uuid::Uuid::new_v4();

        assert_eq!(registry.update(profile, Availability::Available), None);
        let down = registry.update(profile, Availability::Stopped).unwrap();
        assert!(down.went_down());
        assert_eq!(events.try_recv().unwrap(), down);
        assert_eq!(registry.availability(profile), Availability::Stopped);

        let up = registry.update(profile, Availability::Available).unwrap();
        assert!(up.recovered());
    }

    #[tokio::test]
    async fn test_check_once_updates_active_profiles() {
        let store = MemoryStore::new();
        let created = CampaignRepository::create(&store, sample_new_campaign())
            .await
            .unwrap();
        store
            .transition(
                created.id,
                StateChange::new(
                    &[CampaignState::Draft],
                    CampaignState::Queued,
                    TransitionReason::Activated,
                    chrono::Utc::now(),
                ),
            )
            .await
            .unwrap();

        let profile = created.profile_ids[0];
        let probe = Arc::new(Scripted {
            states: Mutex::new(HashMap::from([(profile, Availability::Unhealthy)])),
        });
        let registry = Arc::new(ProfileRegistry::new());
        let (_tx, rx) = watch::channel(Arc::new(VersionedSettings::initial(
            GlobalSettings::default(),
        )));
        let (notifier, mut notifications) = Notifier::channel(4);

        let monitor = HealthMonitor::new(
            Stores::memory(store.clone()),
            probe,
            registry.clone(),
            notifier,
            Arc::new(SystemClock),
            rx,
        );
        assert_eq!(monitor.check_once().await.unwrap(), 1);
        assert_eq!(registry.availability(profile), Availability::Unhealthy);
        assert!(matches!(
            notifications.try_recv().unwrap(),
            Notification::ProfileIssue { .. }
        ));

        let stored = courier_storage::ProfileRepository::get(&store, profile)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.availability, Availability::Unhealthy);

        // Unchanged on the next cycle
        assert_eq!(monitor.check_once().await.unwrap(), 0);
    }
}
