//! PostgreSQL pool for the dispatch repositories

use courier_common::config::DatabaseConfig;
use courier_common::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

/// Connection attempts before startup gives up
const CONNECT_ATTEMPTS: u32 = 5;

/// Shared pool handed to every `Db*` repository
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Connect, retrying with a doubling delay while the database comes up
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("Database URL required for PostgreSQL".to_string()))?;

        let options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30));

        let mut delay = Duration::from_millis(500);
        let mut attempt = 1;
        loop {
            match options.clone().connect(url).await {
                Ok(pool) => {
                    info!(
                        max_connections = config.max_connections,
                        attempt, "Connected to PostgreSQL"
                    );
                    return Ok(Self { pool });
                }
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!(attempt, "PostgreSQL not reachable, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::Database(format!(
                        "Failed to connect after {} attempts: {}",
                        attempt, e
                    )))
                }
            }
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;
        info!("Dispatch schema is up to date");
        Ok(())
    }
}
