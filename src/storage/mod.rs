mod cache;
mod ledger;
mod primary;
mod schema;
mod types;

pub use primary::SqlitePrimaryCatalog;
pub use schema::Database;
pub use types::{
    CacheFilter, CacheRecord, CategoryCount, DatabaseError, FeedItem, NewSyncRun, SyncRunRecord,
    SyncRunStatus, UpsertOutcome,
};
