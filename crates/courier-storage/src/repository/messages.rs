//! Dispatch message repository

use crate::db::DatabasePool;
use crate::models::{Message, MessageCounts, MessageStatus, NewMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::types::{CampaignId, ClientId, MessageId, ProfileId};
use courier_common::{Error, Result};
use std::collections::HashSet;
use uuid::Uuid;

/// Lookup of clients with SENT messages in a time window
#[derive(Debug, Clone, PartialEq)]
pub struct SentQuery {
    pub client_ids: Vec<ClientId>,
    /// Restrict to sends of these campaigns; any campaign when `None`
    pub campaign_ids: Option<Vec<CampaignId>>,
    /// Ignore sends of this campaign run
    pub exclude_run: Option<(CampaignId, i32)>,
    pub since: DateTime<Utc>,
}

/// Message repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Insert a PENDING message; `None` if the unique key already exists
    async fn create(&self, input: NewMessage, at: DateTime<Utc>) -> Result<Option<Message>>;

    async fn get(&self, id: MessageId) -> Result<Option<Message>>;

    /// Atomically move PENDING -> PROCESSING for `profile_id` on behalf of
    /// engine instance `owner` and count the attempt; `None` if the message
    /// is no longer PENDING
    async fn claim(
        &self,
        id: MessageId,
        profile_id: ProfileId,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>>;

    /// PROCESSING -> SENT or FAILED
    async fn complete(
        &self,
        id: MessageId,
        status: MessageStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// PROCESSING -> PENDING, optionally not before `next_attempt_at`
    async fn requeue(
        &self,
        id: MessageId,
        error: Option<String>,
        next_attempt_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// PENDING -> SKIPPED
    async fn skip(&self, id: MessageId, reason: String, at: DateTime<Utc>) -> Result<bool>;

    /// Persist how many payload items were delivered
    async fn record_progress(&self, id: MessageId, items_sent: i32, at: DateTime<Utc>)
        -> Result<()>;

    /// PENDING messages of a run in admission order
    async fn pending_for_run(&self, campaign_id: CampaignId, run: i32) -> Result<Vec<Message>>;

    /// Reset PROCESSING messages claimed by an instance outside
    /// `live_owners` to PENDING
    async fn requeue_orphaned(&self, live_owners: &[String], at: DateTime<Utc>) -> Result<u64>;

    /// Clients admitted into a run
    async fn admitted_clients(&self, campaign_id: CampaignId, run: i32) -> Result<Vec<ClientId>>;

    /// Subset of `query.client_ids` with a matching SENT message
    async fn sent_clients(&self, query: SentQuery) -> Result<HashSet<ClientId>>;

    /// SENT messages of one client in a run
    async fn count_sent_for_client(
        &self,
        campaign_id: CampaignId,
        run: i32,
        client_id: ClientId,
    ) -> Result<i64>;

    async fn counts(&self, campaign_id: CampaignId, run: i32) -> Result<MessageCounts>;

    /// Completion times of a profile's SENT messages since `since`
    async fn sent_times_since(
        &self,
        profile_id: ProfileId,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>>;

    /// Flag a campaign's messages as archived
    async fn archive_campaign(&self, campaign_id: CampaignId) -> Result<u64>;

    async fn list_by_campaign(
        &self,
        campaign_id: CampaignId,
        status: Option<MessageStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>>;
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    campaign_id: Uuid,
    run: i32,
    client_id: Uuid,
    profile_id: Option<Uuid>,
    channel: String,
    phone: String,
    step: i16,
    status: String,
    attempts: i32,
    items_sent: i32,
    claimed_by: Option<String>,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    archived: bool,
}

impl TryFrom<MessageRow> for Message {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: row.id,
            campaign_id: row.campaign_id,
            run: row.run,
            client_id: row.client_id,
            profile_id: row.profile_id,
            channel: row.channel.parse()?,
            phone: row.phone,
            step: row.step,
            status: row.status.parse().map_err(Error::Database)?,
            attempts: row.attempts,
            items_sent: row.items_sent,
            claimed_by: row.claimed_by,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
            archived: row.archived,
        })
    }
}

fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>> {
    rows.into_iter().map(Message::try_from).collect()
}

/// Database message repository
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn create(&self, input: NewMessage, at: DateTime<Utc>) -> Result<Option<Message>> {
        let id = Uuid::now_v7();

        sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (
                id, campaign_id, run, client_id, channel, phone, step, status,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $8)
            ON CONFLICT (campaign_id, run, client_id, channel, phone) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(input.campaign_id)
        .bind(input.run)
        .bind(input.client_id)
        .bind(input.channel.to_string())
        .bind(&input.phone)
        .bind(input.step)
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .map(Message::try_from)
        .transpose()
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?
            .map(Message::try_from)
            .transpose()
    }

    async fn claim(
        &self,
        id: MessageId,
        profile_id: ProfileId,
        owner: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE messages SET
                status = 'processing',
                profile_id = $2,
                claimed_by = $3,
                attempts = attempts + 1,
                next_attempt_at = NULL,
                updated_at = $4
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(profile_id)
        .bind(owner)
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .map(Message::try_from)
        .transpose()
    }

    async fn complete(
        &self,
        id: MessageId,
        status: MessageStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !MessageStatus::Processing.can_transition_to(status) || !status.is_terminal() {
            return Err(Error::Validation(format!(
                "Cannot complete message with status {}",
                status
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE messages SET
                status = $2,
                last_error = COALESCE($3, last_error),
                sent_at = CASE WHEN $2 = 'sent' THEN $4 ELSE sent_at END,
                updated_at = $4
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(&error)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn requeue(
        &self,
        id: MessageId,
        error: Option<String>,
        next_attempt_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET
                status = 'pending',
                last_error = COALESCE($2, last_error),
                next_attempt_at = $3,
                updated_at = $4
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(&error)
        .bind(next_attempt_at)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn skip(&self, id: MessageId, reason: String, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET status = 'skipped', last_error = $2, updated_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(&reason)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_progress(
        &self,
        id: MessageId,
        items_sent: i32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE messages SET items_sent = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(items_sent)
            .bind(at)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn pending_for_run(&self, campaign_id: CampaignId, run: i32) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM messages
            WHERE campaign_id = $1 AND run = $2 AND status = 'pending'
            ORDER BY created_at ASC, step ASC
            "#,
        )
        .bind(campaign_id)
        .bind(run)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        into_messages(rows)
    }

    async fn requeue_orphaned(&self, live_owners: &[String], at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET status = 'pending', claimed_by = NULL, updated_at = $2
            WHERE status = 'processing'
              AND (claimed_by IS NULL OR NOT (claimed_by = ANY($1)))
            "#,
        )
        .bind(live_owners)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn admitted_clients(&self, campaign_id: CampaignId, run: i32) -> Result<Vec<ClientId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT client_id FROM messages WHERE campaign_id = $1 AND run = $2",
        )
        .bind(campaign_id)
        .bind(run)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn sent_clients(&self, query: SentQuery) -> Result<HashSet<ClientId>> {
        if query.client_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let (exclude_campaign, exclude_run) = match query.exclude_run {
            Some((campaign_id, run)) => (Some(campaign_id), Some(run)),
            None => (None, None),
        };

        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT client_id FROM messages
            WHERE client_id = ANY($1)
              AND status = 'sent'
              AND sent_at >= $2
              AND ($3::uuid[] IS NULL OR campaign_id = ANY($3))
              AND NOT ($4::uuid IS NOT NULL AND campaign_id = $4 AND run = $5)
            "#,
        )
        .bind(&query.client_ids)
        .bind(query.since)
        .bind(query.campaign_ids.as_ref())
        .bind(exclude_campaign)
        .bind(exclude_run)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn count_sent_for_client(
        &self,
        campaign_id: CampaignId,
        run: i32,
        client_id: ClientId,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE campaign_id = $1 AND run = $2 AND client_id = $3 AND status = 'sent'
            "#,
        )
        .bind(campaign_id)
        .bind(run)
        .bind(client_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.0)
    }

    async fn counts(&self, campaign_id: CampaignId, run: i32) -> Result<MessageCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM messages
            WHERE campaign_id = $1 AND run = $2
            GROUP BY status
            "#,
        )
        .bind(campaign_id)
        .bind(run)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let mut counts = MessageCounts::default();
        for (status, count) in rows {
            match status.parse::<MessageStatus>().map_err(Error::Database)? {
                MessageStatus::Pending => counts.pending = count,
                MessageStatus::Processing => counts.processing = count,
                MessageStatus::Sent => counts.sent = count,
                MessageStatus::Failed => counts.failed = count,
                MessageStatus::Skipped => counts.skipped = count,
            }
        }
        Ok(counts)
    }

    async fn sent_times_since(
        &self,
        profile_id: ProfileId,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let rows: Vec<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT sent_at FROM messages
            WHERE profile_id = $1 AND status = 'sent' AND sent_at >= $2
            ORDER BY sent_at ASC
            "#,
        )
        .bind(profile_id)
        .bind(since)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(|(at,)| at).collect())
    }

    async fn archive_campaign(&self, campaign_id: CampaignId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET archived = TRUE WHERE campaign_id = $1 AND archived = FALSE",
        )
        .bind(campaign_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn list_by_campaign(
        &self,
        campaign_id: CampaignId,
        status: Option<MessageStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM messages
            WHERE campaign_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at ASC, step ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(campaign_id)
        .bind(status.map(|s| s.to_string()))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        into_messages(rows)
    }
}
