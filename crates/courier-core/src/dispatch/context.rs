use crate::clock::Clock;
use crate::executor::SendExecutor;
use crate::health::ProfileRegistry;
use crate::metrics::DispatchMetrics;
use crate::notify::Notifier;
use crate::pacing::PacingGovernor;
use crate::settings::SettingsWatch;
use courier_common::config::DispatchConfig;
use courier_common::types::{CampaignId, ClientId, ProfileId};
use courier_common::{Error, Result};
use courier_storage::Stores;
use std::sync::Arc;
use std::time::Duration;

/// Services shared by every campaign run in the process
pub struct EngineContext {
    pub stores: Stores,
    pub executor: Arc<dyn SendExecutor>,
    pub governor: Arc<PacingGovernor>,
    pub registry: Arc<ProfileRegistry>,
    pub notifier: Notifier,
    pub metrics: DispatchMetrics,
    pub clock: Arc<dyn Clock>,
    pub settings: SettingsWatch,
    pub config: DispatchConfig,
    /// Owner name written to dispatch locks
    pub instance_id: String,
}

impl EngineContext {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.config.send_timeout_secs.max(1))
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.config.lock_retry_ms.max(1))
    }

    /// Heartbeat age after which another instance's locks are reclaimed.
    /// Never shorter than three supervisor ticks.
    pub fn lease_ttl(&self) -> Duration {
        let floor = self.config.poll_interval_secs.max(1) * 3;
        Duration::from_secs(self.config.lease_ttl_secs.max(floor))
    }

    /// Lock marking this instance as alive
    pub fn instance_lock(&self) -> String {
        format!("instance:{}", self.instance_id)
    }

    /// Acquire or extend the instance lock and every lock this instance holds
    pub async fn heartbeat(&self) -> Result<()> {
        let now = self.clock.now();
        let key = self.instance_lock();
        if !self.stores.locks.try_acquire(&key, &self.instance_id, now).await? {
            if let Some(holder) = self.stores.locks.holder(&key).await? {
                if holder != self.instance_id {
                    return Err(Error::Config(format!("instance id {} is already in use by {}", key, holder)));
                }
            }
        }
        self.stores.locks.refresh(&self.instance_id, now).await?;
        Ok(())
    }
}

pub fn profile_lock(profile_id: ProfileId) -> String {
    format!("profile:{}", profile_id)
}

pub fn client_lock(client_id: ClientId) -> String {
    format!("client:{}", client_id)
}

pub fn campaign_lock(campaign_id: CampaignId) -> String {
    format!("campaign:{}", campaign_id)
}
