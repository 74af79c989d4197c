use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::SyncSummary;

/// Where a run is in its lifecycle.
///
/// `Idle -> Estimating -> Planning -> (Fetching -> Persisting -> Reconciling)*
/// -> Finalizing -> Completed | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunPhase {
    Idle,
    Estimating,
    Planning,
    Fetching,
    Persisting,
    Reconciling,
    Finalizing,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }
}

/// Point-in-time view of a run, emitted after each phase and each page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub phase: RunPhase,
    pub current_page: u32,
    pub total_pages: u32,
    pub items_processed: u64,
    pub new_count: u64,
    pub updated_count: u64,
    pub status_message: String,
    pub estimated_total: Option<u64>,
}

/// Events delivered to a streaming consumer.
///
/// A stream carries any number of `Progress` events followed by exactly one
/// `Completed` or `Failed`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    Progress(ProgressSnapshot),
    Completed(SyncSummary),
    Failed { message: String },
}

impl SyncEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncEvent::Progress(_))
    }
}

/// Best-effort progress sink.
///
/// Uses `try_send` on a bounded channel: when the consumer is slow or gone
/// the snapshot is dropped, so reporting never stalls the write path.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<SyncEvent>>,
    dropped: AtomicU64,
}

impl ProgressReporter {
    /// Reporter that discards everything (polling callers).
    pub fn silent() -> Self {
        Self::default()
    }

    /// Reporter plus the receiving end of its channel.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::from_sender(tx), rx)
    }

    pub fn from_sender(tx: mpsc::Sender<SyncEvent>) -> Self {
        Self {
            tx: Some(tx),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn report(&self, snapshot: ProgressSnapshot) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(SyncEvent::Progress(snapshot)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                tracing::debug!(dropped = dropped, "Progress consumer is behind, snapshot dropped");
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Progress consumer disconnected, snapshot dropped");
            }
        }
    }

    /// Number of snapshots dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn sender(&self) -> Option<&mpsc::Sender<SyncEvent>> {
        self.tx.as_ref()
    }
}
