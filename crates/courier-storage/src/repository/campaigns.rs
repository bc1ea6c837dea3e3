//! Campaign repository

use crate::db::DatabasePool;
use crate::models::{
    Campaign, CampaignCounters, CampaignState, CampaignTransition, NewCampaign, StateChange,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::types::{CampaignId, TenantId};
use courier_common::{Error, Result};
use sqlx::types::Json;
use uuid::Uuid;

/// Campaign repository trait
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn create(&self, input: NewCampaign) -> Result<Campaign>;
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;
    async fn list_by_states(&self, states: &[CampaignState]) -> Result<Vec<Campaign>>;
    async fn count_active_by_owner(&self, owner_id: TenantId) -> Result<i64>;

    /// Compare-and-set state change; `None` when the campaign is not in one
    /// of the expected states. Records a transition row on success.
    async fn transition(&self, id: CampaignId, change: StateChange) -> Result<Option<Campaign>>;

    async fn transitions(&self, id: CampaignId) -> Result<Vec<CampaignTransition>>;

    /// Begin a new run: bump the run number, store the ordering seed and
    /// recipient estimate, reset counters
    async fn start_run(
        &self,
        id: CampaignId,
        seed: i64,
        total_recipients: i64,
        at: DateTime<Utc>,
    ) -> Result<Campaign>;

    async fn set_counters(&self, id: CampaignId, counters: CampaignCounters) -> Result<()>;

    /// Store a new ordering seed for the current run
    async fn set_run_seed(&self, id: CampaignId, seed: i64) -> Result<()>;

    /// Campaigns whose run ended before `before` and will not run again
    async fn list_finished_before(&self, before: DateTime<Utc>) -> Result<Vec<CampaignId>>;
}

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    template_id: Uuid,
    group_id: Uuid,
    campaign_type: String,
    target: Json<courier_common::types::MessengerTarget>,
    profile_ids: Vec<Uuid>,
    schedule: Json<courier_common::types::ScheduleConfig>,
    filter: Json<courier_common::types::FilterConfig>,
    options: Json<courier_common::types::OptionsConfig>,
    state: String,
    pause_reason: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    run: i32,
    run_seed: i64,
    total_recipients: i64,
    sent_count: i64,
    failed_count: i64,
    skipped_count: i64,
    remaining_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = Error;

    fn try_from(row: CampaignRow) -> Result<Self> {
        Ok(Campaign {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            template_id: row.template_id,
            group_id: row.group_id,
            campaign_type: row.campaign_type.parse()?,
            target: row.target.0,
            profile_ids: row.profile_ids,
            schedule: row.schedule.0,
            filter: row.filter.0,
            options: row.options.0,
            state: row.state.parse().map_err(Error::Database)?,
            pause_reason: row
                .pause_reason
                .map(|r| r.parse())
                .transpose()
                .map_err(Error::Database)?,
            scheduled_at: row.scheduled_at,
            run: row.run,
            run_seed: row.run_seed,
            total_recipients: row.total_recipients,
            counters: CampaignCounters {
                sent: row.sent_count,
                failed: row.failed_count,
                skipped: row.skipped_count,
                remaining: row.remaining_count,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    campaign_id: Uuid,
    from_state: String,
    to_state: String,
    reason: String,
    detail: Option<String>,
    at: DateTime<Utc>,
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn state_strings(states: &[CampaignState]) -> Vec<String> {
    states.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn create(&self, input: NewCampaign) -> Result<Campaign> {
        let id = Uuid::now_v7();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, owner_id, name, template_id, group_id, campaign_type, target,
                profile_ids, schedule, filter, options, state, scheduled_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'draft', $12, $13, $13)
            "#,
        )
        .bind(id)
        .bind(input.owner_id)
        .bind(&input.name)
        .bind(input.template_id)
        .bind(input.group_id)
        .bind(input.campaign_type.to_string())
        .bind(Json(&input.target))
        .bind(&input.profile_ids)
        .bind(Json(&input.schedule))
        .bind(Json(&input.filter))
        .bind(Json(&input.options))
        .bind(input.scheduled_at)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        self.get(id)
            .await?
            .ok_or_else(|| Error::Internal("Failed to create campaign".to_string()))
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, CampaignRow>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?
            .map(Campaign::try_from)
            .transpose()
    }

    async fn list_by_states(&self, states: &[CampaignState]) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, CampaignRow>(
            "SELECT * FROM campaigns WHERE state = ANY($1) ORDER BY created_at ASC",
        )
        .bind(state_strings(states))
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .into_iter()
        .map(Campaign::try_from)
        .collect()
    }

    async fn count_active_by_owner(&self, owner_id: TenantId) -> Result<i64> {
        let active = state_strings(&[
            CampaignState::Scheduled,
            CampaignState::Queued,
            CampaignState::Running,
            CampaignState::Paused,
        ]);

        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM campaigns WHERE owner_id = $1 AND state = ANY($2)",
        )
        .bind(owner_id)
        .bind(active)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.0)
    }

    async fn transition(&self, id: CampaignId, change: StateChange) -> Result<Option<Campaign>> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT state FROM campaigns WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        let from: CampaignState = match current {
            Some((state,)) => state.parse().map_err(Error::Database)?,
            None => return Ok(None),
        };
        if !change.from.contains(&from) || !from.can_transition_to(change.to) {
            return Ok(None);
        }

        let to = change.to.to_string();
        sqlx::query(
            r#"
            UPDATE campaigns SET
                state = $2,
                pause_reason = $3,
                scheduled_at = COALESCE($4, scheduled_at),
                completed_at = CASE WHEN $2 IN ('completed', 'cancelled', 'error')
                                    THEN $5 ELSE completed_at END,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&to)
        .bind(change.pause_reason.map(|r| r.to_string()))
        .bind(change.scheduled_at)
        .bind(change.at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO campaign_transitions (campaign_id, from_state, to_state, reason, detail, at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(from.to_string())
        .bind(&to)
        .bind(change.reason.as_str())
        .bind(&change.detail)
        .bind(change.at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        self.get(id).await
    }

    async fn transitions(&self, id: CampaignId) -> Result<Vec<CampaignTransition>> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT campaign_id, from_state, to_state, reason, detail, at
            FROM campaign_transitions
            WHERE campaign_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.into_iter()
            .map(|row| -> Result<CampaignTransition> {
                Ok(CampaignTransition {
                    campaign_id: row.campaign_id,
                    from_state: row.from_state.parse().map_err(Error::Database)?,
                    to_state: row.to_state.parse().map_err(Error::Database)?,
                    reason: row.reason,
                    detail: row.detail,
                    at: row.at,
                })
            })
            .collect()
    }

    async fn start_run(
        &self,
        id: CampaignId,
        seed: i64,
        total_recipients: i64,
        at: DateTime<Utc>,
    ) -> Result<Campaign> {
        sqlx::query_as::<_, CampaignRow>(
            r#"
            UPDATE campaigns SET
                run = run + 1,
                run_seed = $2,
                total_recipients = $3,
                sent_count = 0,
                failed_count = 0,
                skipped_count = 0,
                remaining_count = 0,
                started_at = $4,
                completed_at = NULL,
                updated_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(seed)
        .bind(total_recipients)
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("Campaign {}", id)))
        .and_then(Campaign::try_from)
    }

    async fn set_counters(&self, id: CampaignId, counters: CampaignCounters) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                sent_count = $2, failed_count = $3, skipped_count = $4,
                remaining_count = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(counters.sent)
        .bind(counters.failed)
        .bind(counters.skipped)
        .bind(counters.remaining)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn set_run_seed(&self, id: CampaignId, seed: i64) -> Result<()> {
        sqlx::query("UPDATE campaigns SET run_seed = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(seed)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_finished_before(&self, before: DateTime<Utc>) -> Result<Vec<CampaignId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM campaigns
            WHERE state IN ('completed', 'cancelled', 'error')
              AND completed_at IS NOT NULL
              AND completed_at < $1
            "#,
        )
        .bind(before)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
