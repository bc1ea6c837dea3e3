//! Engine assembly
//!
//! Wires stores, the profile-worker interfaces and the shared dispatch
//! services together and owns the background tasks.

use crate::campaign::{CampaignManager, RecoveryReport, Supervisor};
use crate::clock::Clock;
use crate::dispatch::{Dispatcher, EngineContext};
use crate::executor::{HealthProbe, SendExecutor};
use crate::health::{HealthMonitor, ProfileRegistry};
use crate::metrics::DispatchMetrics;
use crate::notify::Notifier;
use crate::pacing::PacingGovernor;
use anyhow::{Context, Result};
use courier_common::config::DispatchConfig;
use courier_common::{GlobalSettings, VersionedSettings};
use courier_storage::Stores;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// External collaborators of the engine
pub struct EngineDeps {
    pub stores: Stores,
    pub executor: Arc<dyn SendExecutor>,
    pub probe: Arc<dyn HealthProbe>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Notifier,
}

/// Campaign dispatch engine
pub struct Engine {
    manager: CampaignManager,
    dispatcher: Arc<Dispatcher>,
    probe: Arc<dyn HealthProbe>,
    metrics: DispatchMetrics,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build the engine. Stored global settings win over `defaults`, which
    /// are only used until the operator saves settings.
    pub async fn new(deps: EngineDeps, config: DispatchConfig, defaults: GlobalSettings) -> Result<Self> {
        let EngineDeps {
            stores,
            executor,
            probe,
            clock,
            notifier,
        } = deps;

        let settings = match stores
            .settings
            .load_global()
            .await
            .context("Failed to load global settings")?
        {
            Some(stored) => stored,
            None => {
                defaults
                    .validate()
                    .context("Invalid default global settings")?;
                VersionedSettings {
                    version: 0,
                    settings: defaults,
                    updated_at: clock.now(),
                }
            }
        };
        info!(version = settings.version, "Global settings loaded");
        let (settings_tx, settings_rx) = watch::channel(Arc::new(settings));

        let metrics = DispatchMetrics::new().context("Failed to register metrics")?;
        let ctx = Arc::new(EngineContext {
            stores,
            executor,
            governor: Arc::new(PacingGovernor::new()),
            registry: Arc::new(ProfileRegistry::new()),
            notifier,
            metrics: metrics.clone(),
            clock,
            settings: settings_rx,
            config,
            instance_id: format!("courier-{}", Uuid::new_v4()),
        });
        let dispatcher = Arc::new(Dispatcher::new(ctx));
        let manager = CampaignManager::new(dispatcher.clone(), settings_tx);

        Ok(Self {
            manager,
            dispatcher,
            probe,
            metrics,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn manager(&self) -> &CampaignManager {
        &self.manager
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> Arc<ProfileRegistry> {
        self.dispatcher.context().registry.clone()
    }

    /// Recover from the previous process, then start the supervisor and
    /// the health monitor
    pub async fn start(&mut self) -> Result<RecoveryReport> {
        let supervisor = Supervisor::new(self.dispatcher.clone());
        let report = supervisor
            .recover()
            .await
            .context("Restart recovery failed")?;

        let ctx = self.dispatcher.context();
        let monitor = HealthMonitor::new(
            ctx.stores.clone(),
            self.probe.clone(),
            ctx.registry.clone(),
            ctx.notifier.clone(),
            ctx.clock.clone(),
            ctx.settings.clone(),
        );
        self.tasks.push(monitor.spawn(self.cancel.child_token()));
        self.tasks.push(supervisor.spawn(self.cancel.child_token()));

        info!(instance = %ctx.instance_id, "Dispatch engine started");
        Ok(report)
    }

    /// Stop background tasks and let every run finish its in-flight sends
    pub async fn shutdown(self) {
        info!("Shutting down dispatch engine");
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.dispatcher.shutdown().await;

        let ctx = self.dispatcher.context();
        match ctx.stores.locks.release_all_held_by(&ctx.instance_id).await {
            Ok(released) => debug!(released, "Released dispatch locks"),
            Err(e) => warn!("Failed to release dispatch locks: {}", e),
        }
        info!("Dispatch engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_settings, test_config, FakeProbe, TestEngine};
    use courier_storage::{CampaignState, MessageStatus, NewMessage, StateChange, TransitionReason};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_restart_recovers_interrupted_run() {
        // State left behind by a process that stopped mid-send
        let fixture = TestEngine::new(2, 4);
        let campaign = fixture.draft().await;
        let now = fixture.clock.now();
        let stores = fixture.stores.clone();
        stores
            .campaigns
            .transition(
                campaign.id,
                StateChange::new(
                    &[CampaignState::Draft],
                    CampaignState::Queued,
                    TransitionReason::Activated,
                    now,
                ),
            )
            .await
            .unwrap();
        let campaign = stores.campaigns.start_run(campaign.id, 11, 4, now).await.unwrap();
        let interrupted = stores
            .messages
            .create(
                NewMessage {
                    campaign_id: campaign.id,
                    run: campaign.run,
                    client_id: fixture.clients[0].id,
                    channel: courier_common::types::Channel::Whatsapp,
                    phone: fixture.clients[0].phone.clone(),
                    step: 0,
                },
                now,
            )
            .await
            .unwrap()
            .unwrap();
        stores
            .messages
            .claim(interrupted.id, fixture.profiles[0], "courier-gone", now)
            .await
            .unwrap();

        let deps = EngineDeps {
            stores: stores.clone(),
            executor: fixture.executor.clone(),
            probe: Arc::new(FakeProbe::default()),
            clock: Arc::new(fixture.clock),
            notifier: Notifier::disabled(),
        };
        let mut engine = Engine::new(deps, test_config(), fast_settings()).await.unwrap();
        assert_eq!(engine.manager().global_settings().version, 0);

        let report = engine.start().await.unwrap();
        assert_eq!(report.requeued_messages, 1);
        assert_eq!(report.resumed_campaigns, 1);

        let mut done = None;
        for _ in 0..600 {
            let status = engine.manager().status(campaign.id).await.unwrap();
            if status.state == CampaignState::Completed {
                done = Some(status);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let done = done.expect("campaign completes after restart");
        assert_eq!(done.run, 1);
        assert_eq!(done.counters.sent, 4);
        assert_eq!(fixture.executor.requests_to(&fixture.clients[0].phone), 1);

        let resent = fixture
            .memory
            .messages_of(campaign.id)
            .into_iter()
            .find(|m| m.id == interrupted.id)
            .unwrap();
        assert_eq!(resent.status, MessageStatus::Sent);
        assert!(engine.metrics().sends("sent") >= 4);

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stored_settings_win_over_defaults() {
        let fixture = TestEngine::new(1, 0);
        fixture
            .manager
            .update_global_settings(GlobalSettings {
                max_contacts_per_day: 42,
                ..fast_settings()
            })
            .await
            .unwrap();

        let deps = EngineDeps {
            stores: fixture.stores.clone(),
            executor: fixture.executor.clone(),
            probe: Arc::new(FakeProbe::default()),
            clock: Arc::new(fixture.clock),
            notifier: Notifier::disabled(),
        };
        let engine = Engine::new(deps, test_config(), fast_settings()).await.unwrap();
        let settings = engine.manager().global_settings();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.settings.max_contacts_per_day, 42);
    }

    #[tokio::test]
    async fn test_invalid_defaults_rejected() {
        let fixture = TestEngine::new(1, 0);
        let deps = EngineDeps {
            stores: fixture.stores.clone(),
            executor: fixture.executor.clone(),
            probe: Arc::new(FakeProbe::default()),
            clock: Arc::new(fixture.clock),
            notifier: Notifier::disabled(),
        };
        let defaults = GlobalSettings {
            timezone: "Mars/Olympus".to_string(),
            ..fast_settings()
        };
        assert!(Engine::new(deps, test_config(), defaults).await.is_err());
    }
}
