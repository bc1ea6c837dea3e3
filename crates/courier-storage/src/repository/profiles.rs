//! Profile runtime state repository

use crate::db::DatabasePool;
use crate::models::ProfileState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::types::{Availability, ProfileId};
use courier_common::{Error, Result};
use uuid::Uuid;

/// Profile repository trait
#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn get(&self, id: ProfileId) -> Result<Option<ProfileState>>;

    async fn set_availability(
        &self,
        id: ProfileId,
        availability: Availability,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Record the first send of a profile; later calls keep the first value
    async fn mark_first_used(&self, id: ProfileId, at: DateTime<Utc>) -> Result<()>;
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    profile_id: Uuid,
    availability: String,
    first_used_at: Option<DateTime<Utc>>,
    last_checked_at: Option<DateTime<Utc>>,
}

/// Database profile repository
pub struct DbProfileRepository {
    pool: DatabasePool,
}

impl DbProfileRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileRepository for DbProfileRepository {
    async fn get(&self, id: ProfileId) -> Result<Option<ProfileState>> {
        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT * FROM profile_states WHERE profile_id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.map(|row| -> Result<ProfileState> {
            Ok(ProfileState {
                profile_id: row.profile_id,
                availability: row.availability.parse()?,
                first_used_at: row.first_used_at,
                last_checked_at: row.last_checked_at,
            })
        })
        .transpose()
    }

    async fn set_availability(
        &self,
        id: ProfileId,
        availability: Availability,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profile_states (profile_id, availability, last_checked_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (profile_id) DO UPDATE SET
                availability = EXCLUDED.availability,
                last_checked_at = EXCLUDED.last_checked_at
            "#,
        )
        .bind(id)
        .bind(availability.to_string())
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn mark_first_used(&self, id: ProfileId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profile_states (profile_id, first_used_at)
            VALUES ($1, $2)
            ON CONFLICT (profile_id) DO UPDATE SET
                first_used_at = COALESCE(profile_states.first_used_at, EXCLUDED.first_used_at)
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
