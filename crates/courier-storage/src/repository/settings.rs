//! Global settings and tenant limits repository

use crate::db::DatabasePool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::types::TenantId;
use courier_common::{Error, GlobalSettings, Result, UserCampaignLimits, VersionedSettings};
use sqlx::types::Json;

/// Settings repository trait
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// Stored global settings, if the operator has saved any
    async fn load_global(&self) -> Result<Option<VersionedSettings>>;

    /// Store new global settings under the next version
    async fn save_global(
        &self,
        settings: GlobalSettings,
        at: DateTime<Utc>,
    ) -> Result<VersionedSettings>;

    async fn user_limits(&self, user_id: TenantId) -> Result<Option<UserCampaignLimits>>;

    async fn save_user_limits(&self, limits: UserCampaignLimits) -> Result<()>;
}

/// Database settings repository
pub struct DbSettingsRepository {
    pool: DatabasePool,
}

impl DbSettingsRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for DbSettingsRepository {
    async fn load_global(&self) -> Result<Option<VersionedSettings>> {
        let row: Option<(i64, Json<GlobalSettings>, DateTime<Utc>)> =
            sqlx::query_as("SELECT version, settings, updated_at FROM global_settings WHERE id = 1")
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|(version, settings, updated_at)| VersionedSettings {
            version,
            settings: settings.0,
            updated_at,
        }))
    }

    async fn save_global(
        &self,
        settings: GlobalSettings,
        at: DateTime<Utc>,
    ) -> Result<VersionedSettings> {
        let (version,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO global_settings (id, version, settings, updated_at)
            VALUES (1, 1, $1, $2)
            ON CONFLICT (id) DO UPDATE SET
                version = global_settings.version + 1,
                settings = EXCLUDED.settings,
                updated_at = EXCLUDED.updated_at
            RETURNING version
            "#,
        )
        .bind(Json(&settings))
        .bind(at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(VersionedSettings {
            version,
            settings,
            updated_at: at,
        })
    }

    async fn user_limits(&self, user_id: TenantId) -> Result<Option<UserCampaignLimits>> {
        let row: Option<(Json<UserCampaignLimits>,)> =
            sqlx::query_as("SELECT limits FROM user_campaign_limits WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|(limits,)| limits.0))
    }

    async fn save_user_limits(&self, limits: UserCampaignLimits) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_campaign_limits (user_id, limits, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                limits = EXCLUDED.limits,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(limits.user_id)
        .bind(Json(&limits))
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
