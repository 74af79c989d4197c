//! Feed-to-cache synchronization.
//!
//! A run estimates the feed, plans a page window, then walks it one page at
//! a time: fetch, persist in one transaction, reconcile import status,
//! report progress. Every run appends one entry to the sync ledger.

mod engine;
mod planner;
mod progress;
mod reconcile;

pub use engine::{SyncEngine, SyncError, SyncSummary};
pub use planner::{boundary_take, plan, SyncMode, SyncPlan, SyncRequest, BOUNDARY_BUFFER};
pub use progress::{ProgressReporter, ProgressSnapshot, RunPhase, SyncEvent};
pub use reconcile::{ImportStatusReconciler, PromotedLookup};
