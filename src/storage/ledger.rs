use anyhow::Result;

use super::schema::Database;
use super::types::{NewSyncRun, SyncRunDbRow, SyncRunRecord};

/// Maximum number of ledger rows returned by `recent_sync_runs`
const MAX_RECENT_RUNS: i64 = 500;

const RUN_COLUMNS: &str = "id, status, mode, site_id, order_by, start_page, max_pages, items_seen, \
     new_count, updated_count, skipped_count, duration_ms, error_message, created_at";

impl Database {
    // ========================================================================
    // Sync Ledger
    // ========================================================================

    /// Append one audit record for a finished run, returning its id.
    ///
    /// The ledger is append-only: there is no update or delete counterpart.
    pub async fn record_sync_run(&self, run: &NewSyncRun) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_runs (
                status, mode, site_id, order_by, start_page, max_pages, items_seen,
                new_count, updated_count, skipped_count, duration_ms, error_message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(run.status.as_str())
        .bind(&run.mode)
        .bind(&run.site_id)
        .bind(&run.order_by)
        .bind(run.start_page)
        .bind(run.max_pages)
        .bind(run.items_seen)
        .bind(run.new_count)
        .bind(run.updated_count)
        .bind(run.skipped_count)
        .bind(run.duration_ms)
        .bind(&run.error_message)
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent successful run, if any. Used for "time since last sync".
    pub async fn last_successful_sync(&self) -> Result<Option<SyncRunRecord>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE status = 'success' \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, SyncRunDbRow>(&sql)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(SyncRunDbRow::into_record))
    }

    /// Most recent runs of any status, newest first.
    pub async fn recent_sync_runs(&self, limit: i64) -> Result<Vec<SyncRunRecord>> {
        let limit = limit.clamp(1, MAX_RECENT_RUNS);
        let sql = format!("SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY created_at DESC, id DESC LIMIT ?");
        let rows = sqlx::query_as::<_, SyncRunDbRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(SyncRunDbRow::into_record).collect())
    }
}
