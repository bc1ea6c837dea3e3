//! Template content repository (read-only)

use crate::db::DatabasePool;
use crate::models::{Template, TemplateItem};
use async_trait::async_trait;
use courier_common::types::TemplateId;
use courier_common::{Error, Result};
use sqlx::types::Json;

/// Template repository trait
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get(&self, id: TemplateId) -> Result<Option<Template>>;
}

/// Database template repository
pub struct DbTemplateRepository {
    pool: DatabasePool,
}

impl DbTemplateRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for DbTemplateRepository {
    async fn get(&self, id: TemplateId) -> Result<Option<Template>> {
        let row: Option<(Json<Vec<TemplateItem>>,)> =
            sqlx::query_as("SELECT items FROM templates WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|(items,)| Template { id, items: items.0 }))
    }
}
