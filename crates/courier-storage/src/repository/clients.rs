//! Client directory repository

use crate::db::DatabasePool;
use crate::models::{Client, ClientCursor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::types::{ClientId, GroupId};
use courier_common::{Error, Result};
use uuid::Uuid;

/// Client repository trait
#[async_trait]
pub trait ClientRepository: Send + Sync {
    /// Members of a group in creation order, starting after `after`
    async fn page(
        &self,
        group_id: GroupId,
        after: Option<ClientCursor>,
        limit: u32,
    ) -> Result<Vec<Client>>;

    /// All member ids of a group in creation order
    async fn ids(&self, group_id: GroupId) -> Result<Vec<ClientId>>;

    /// Fetch clients by id; missing ids are ignored, order follows `ids`
    async fn get_many(&self, ids: &[ClientId]) -> Result<Vec<Client>>;

    /// Record that a campaign reached the client
    async fn record_campaign_contact(&self, id: ClientId, at: DateTime<Utc>) -> Result<()>;
}

#[derive(sqlx::FromRow)]
struct ClientRow {
    id: Uuid,
    phone: String,
    region: Option<String>,
    status: String,
    whatsapp_status: String,
    telegram_status: String,
    last_campaign_at: Option<DateTime<Utc>>,
    campaign_count: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<ClientRow> for Client {
    type Error = Error;

    fn try_from(row: ClientRow) -> Result<Self> {
        Ok(Client {
            id: row.id,
            phone: row.phone,
            region: row.region,
            status: row.status,
            whatsapp_status: row.whatsapp_status.parse()?,
            telegram_status: row.telegram_status.parse()?,
            last_campaign_at: row.last_campaign_at,
            campaign_count: row.campaign_count,
            created_at: row.created_at,
        })
    }
}

/// Database client repository
pub struct DbClientRepository {
    pool: DatabasePool,
}

impl DbClientRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClientRepository for DbClientRepository {
    async fn page(
        &self,
        group_id: GroupId,
        after: Option<ClientCursor>,
        limit: u32,
    ) -> Result<Vec<Client>> {
        let rows = sqlx::query_as::<_, ClientRow>(
            r#"
            SELECT c.* FROM clients c
            JOIN group_members g ON g.client_id = c.id
            WHERE g.group_id = $1
              AND ($2::timestamptz IS NULL OR (c.created_at, c.id) > ($2, $3))
            ORDER BY c.created_at ASC, c.id ASC
            LIMIT $4
            "#,
        )
        .bind(group_id)
        .bind(after.map(|c| c.created_at))
        .bind(after.map(|c| c.id))
        .bind(i64::from(limit))
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.into_iter().map(Client::try_from).collect()
    }

    async fn ids(&self, group_id: GroupId) -> Result<Vec<ClientId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT c.id FROM clients c
            JOIN group_members g ON g.client_id = c.id
            WHERE g.group_id = $1
            ORDER BY c.created_at ASC, c.id ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_many(&self, ids: &[ClientId]) -> Result<Vec<Client>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, ClientRow>("SELECT * FROM clients WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut clients = rows
            .into_iter()
            .map(Client::try_from)
            .collect::<Result<Vec<_>>>()?;
        clients.sort_by_key(|c| ids.iter().position(|id| *id == c.id));
        Ok(clients)
    }

    async fn record_campaign_contact(&self, id: ClientId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE clients SET
                last_campaign_at = $2,
                campaign_count = campaign_count + 1
            WHERE id = $1
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
