use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process has locked the database
    #[error("The cache database is locked by another process. Wait for it to finish and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Feed Items
// ============================================================================

/// One well-formed item parsed from a feed page, ready to persist.
///
/// Timestamps are unix seconds (UTC).
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub quality_score: Option<f64>,
    pub thumb_url: Option<String>,
    pub game_url: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub orientation: Option<String>,
    pub published_at: Option<i64>,
    pub modified_at: Option<i64>,
}

/// Counts produced by persisting one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Rows created by this page
    pub inserted: usize,
    /// Rows that already existed and were refreshed
    pub updated: usize,
}

// ============================================================================
// Cache Records
// ============================================================================

/// A mirrored feed item as stored in `cached_games`.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub quality_score: Option<f64>,
    pub thumb_url: Option<String>,
    pub game_url: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub orientation: Option<String>,
    pub published_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub first_seen_at: i64,
    pub last_sync_at: i64,
    pub is_imported: bool,
    pub import_count: i64,
    pub last_imported_at: Option<i64>,
}

/// Operator-facing filter for browsing the cache.
///
/// Unset fields do not constrain the query.
#[derive(Debug, Clone, Default)]
pub struct CacheFilter {
    pub category: Option<String>,
    pub imported: Option<bool>,
    /// Case-insensitive substring match on title
    pub search: Option<String>,
    pub orientation: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Distinct category with the number of cached rows in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryCount {
    pub category: String,
    pub count: i64,
}

// ============================================================================
// Sync Ledger
// ============================================================================

/// Terminal status of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRunStatus {
    Success,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Success => "success",
            SyncRunStatus::Failed => "failed",
        }
    }

    pub(crate) fn from_db(value: &str) -> Self {
        match value {
            "success" => SyncRunStatus::Success,
            _ => SyncRunStatus::Failed,
        }
    }
}

/// Ledger entry to append at the end of a run.
#[derive(Debug, Clone)]
pub struct NewSyncRun {
    pub status: SyncRunStatus,
    pub mode: String,
    pub site_id: String,
    pub order_by: String,
    pub start_page: i64,
    pub max_pages: Option<i64>,
    pub items_seen: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub skipped_count: i64,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
}

/// Internal row type for ledger queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SyncRunDbRow {
    pub id: i64,
    pub status: String,
    pub mode: String,
    pub site_id: String,
    pub order_by: String,
    pub start_page: i64,
    pub max_pages: Option<i64>,
    pub items_seen: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub skipped_count: i64,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl SyncRunDbRow {
    pub(crate) fn into_record(self) -> SyncRunRecord {
        SyncRunRecord {
            id: self.id,
            status: SyncRunStatus::from_db(&self.status),
            mode: self.mode,
            site_id: self.site_id,
            order_by: self.order_by,
            start_page: self.start_page,
            max_pages: self.max_pages,
            items_seen: self.items_seen,
            new_count: self.new_count,
            updated_count: self.updated_count,
            skipped_count: self.skipped_count,
            duration_ms: self.duration_ms,
            error_message: self.error_message,
            created_at: self.created_at,
        }
    }
}

/// A persisted ledger entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunRecord {
    pub id: i64,
    pub status: SyncRunStatus,
    pub mode: String,
    pub site_id: String,
    pub order_by: String,
    pub start_page: i64,
    pub max_pages: Option<i64>,
    pub items_seen: i64,
    pub new_count: i64,
    pub updated_count: i64,
    pub skipped_count: i64,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
}
