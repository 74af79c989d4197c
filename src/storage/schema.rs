use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the local cache store.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// database lock (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            }
        }

        // busy_timeout=5000: wait up to 5 seconds for a competing writer
        // (a second sync run, an operator browsing) before SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");

        // Every connection to ":memory:" is a distinct database, so an
        // in-memory store must live on exactly one connection that never expires.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Mirrored feed items, keyed by the feed-assigned id
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cached_games (
                external_id TEXT PRIMARY KEY NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                category TEXT,
                quality_score REAL,
                thumb_url TEXT,
                game_url TEXT,
                width INTEGER,
                height INTEGER,
                orientation TEXT,
                published_at INTEGER,
                modified_at INTEGER,
                first_seen_at INTEGER NOT NULL,
                last_sync_at INTEGER NOT NULL,
                is_imported INTEGER NOT NULL DEFAULT 0,
                import_count INTEGER NOT NULL DEFAULT 0,
                last_imported_at INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cached_games_published ON cached_games(published_at DESC)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cached_games_category ON cached_games(category)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cached_games_imported ON cached_games(is_imported)",
        )
        .execute(&mut *tx)
        .await?;

        // Append-only audit trail, one row per sync invocation
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_runs (
                id INTEGER PRIMARY KEY,
                status TEXT NOT NULL CHECK (status IN ('success', 'failed')),
                mode TEXT NOT NULL,
                site_id TEXT NOT NULL,
                order_by TEXT NOT NULL,
                start_page INTEGER NOT NULL,
                max_pages INTEGER,
                items_seen INTEGER NOT NULL,
                new_count INTEGER NOT NULL,
                updated_count INTEGER NOT NULL,
                skipped_count INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                error_message TEXT,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Covers last_successful_sync(): WHERE status = 'success' ORDER BY created_at DESC
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_runs_status_created ON sync_runs(status, created_at DESC)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
