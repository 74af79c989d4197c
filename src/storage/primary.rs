//! Read-only adapter over the primary catalog database.
//!
//! The primary catalog is owned by another application; this side only ever
//! asks which feed items have already been promoted into it.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    QueryBuilder, SqlitePool,
};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;
use crate::sync::PromotedLookup;

/// Primary catalog backed by a SQLite `games(platform, external_id)` table.
#[derive(Clone)]
pub struct SqlitePrimaryCatalog {
    pool: SqlitePool,
}

impl SqlitePrimaryCatalog {
    /// Open the primary catalog read-only.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))
            .map_err(DatabaseError::from_sqlx)?
            .read_only(true)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used when the caller already manages one).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PromotedLookup for SqlitePrimaryCatalog {
    async fn lookup_promoted_ids(
        &self,
        platform_tag: &str,
        external_ids: &[String],
    ) -> Result<HashSet<String>> {
        if external_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT external_id FROM games WHERE platform = ");
        builder.push_bind(platform_tag);
        builder.push(" AND external_id IN (");
        let mut separated = builder.separated(", ");
        for id in external_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<(String,)> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
