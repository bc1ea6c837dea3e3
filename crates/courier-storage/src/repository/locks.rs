//! Cross-process dispatch locks

use crate::db::DatabasePool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{Error, Result};

/// Lock repository trait
///
/// Keys are `profile:<id>` for in-flight sends on a profile, `client:<id>`
/// for in-flight sends to a client, `campaign:<id>` for the instance running
/// a campaign and `instance:<id>` for the liveness of an engine instance.
/// Owners keep their locks alive with [`LockRepository::refresh`]; a lock
/// that is not refreshed within the lease belongs to a dead instance.
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// Insert-if-absent; `false` when another holder owns the key
    async fn try_acquire(&self, key: &str, owner: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Release a key held by `owner`
    async fn release(&self, key: &str, owner: &str) -> Result<()>;

    /// Current holder of a key
    async fn holder(&self, key: &str) -> Result<Option<String>>;

    /// Heartbeat: extend every lock held by `owner`
    async fn refresh(&self, owner: &str, at: DateTime<Utc>) -> Result<u64>;

    /// Owners with at least one lock refreshed at or after `since`
    async fn live_owners(&self, since: DateTime<Utc>) -> Result<Vec<String>>;

    /// Drop locks not refreshed since `before`
    async fn release_expired(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Drop every lock held by `owner`
    async fn release_all_held_by(&self, owner: &str) -> Result<u64>;
}

/// Database lock repository
pub struct DbLockRepository {
    pool: DatabasePool,
}

impl DbLockRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockRepository for DbLockRepository {
    async fn try_acquire(&self, key: &str, owner: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO dispatch_locks (lock_key, owner, acquired_at, refreshed_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (lock_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM dispatch_locks WHERE lock_key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn holder(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT owner FROM dispatch_locks WHERE lock_key = $1")
                .bind(key)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.map(|(owner,)| owner))
    }

    async fn refresh(&self, owner: &str, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("UPDATE dispatch_locks SET refreshed_at = $2 WHERE owner = $1")
            .bind(owner)
            .bind(at)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn live_owners(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT owner FROM dispatch_locks WHERE refreshed_at >= $1")
                .bind(since)
                .fetch_all(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        Ok(rows.into_iter().map(|(owner,)| owner).collect())
    }

    async fn release_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dispatch_locks WHERE refreshed_at < $1")
            .bind(before)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn release_all_held_by(&self, owner: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dispatch_locks WHERE owner = $1")
            .bind(owner)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
