//! Courier - campaign dispatch service entry point

use anyhow::Result;
use courier_common::config::{Config, LoggingConfig};
use courier_core::{
    spawn_relay, Engine, EngineDeps, HttpWorkerClient, Notifier, SystemClock, TelegramRelay,
};
use courier_storage::{db::DatabasePool, MemoryStore, Stores};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Courier dispatch service...");

    // Initialize storage
    let stores = match config.database.backend.as_str() {
        "memory" => {
            warn!("Using in-memory storage; campaign state is lost on exit");
            Stores::memory(MemoryStore::new())
        }
        _ => {
            let db_pool = DatabasePool::new(&config.database).await?;
            db_pool.migrate().await?;
            Stores::postgres(db_pool)
        }
    };

    // Profile worker client doubles as executor and health probe
    let worker = Arc::new(HttpWorkerClient::new(&config.worker)?);
    info!("Profile worker service at {}", config.worker.base_url);

    // Notification relay
    let relay_cancel = CancellationToken::new();
    let (notifier, relay_handle) = match (&config.notifications.telegram, config.notifications.enabled) {
        (Some(telegram), true) => {
            let (notifier, rx) = Notifier::channel(config.notifications.queue_capacity);
            let sink = Arc::new(TelegramRelay::new(telegram)?);
            let handle = spawn_relay(rx, sink, relay_cancel.clone());
            (notifier, Some(handle))
        }
        _ => {
            info!("Notifications disabled");
            (Notifier::disabled(), None)
        }
    };

    let deps = EngineDeps {
        stores,
        executor: worker.clone(),
        probe: worker,
        clock: Arc::new(SystemClock),
        notifier,
    };
    let mut engine = Engine::new(deps, config.dispatch.clone(), config.defaults.clone()).await?;
    let report = engine.start().await?;
    info!(
        resumed = report.resumed_campaigns,
        held = report.held_campaigns,
        "Courier dispatch service started"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // In-flight sends finish before the engine returns
    engine.shutdown().await;

    relay_cancel.cancel();
    if let Some(handle) = relay_handle {
        let _ = handle.await;
    }

    info!("Courier shutdown complete");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},courier=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
