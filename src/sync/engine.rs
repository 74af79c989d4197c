use chrono::Utc;
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::planner::{plan, SyncMode, SyncPlan, SyncRequest};
use super::progress::{ProgressReporter, ProgressSnapshot, RunPhase, SyncEvent};
use super::reconcile::ImportStatusReconciler;
use crate::feed::{estimate_total, FeedClient, FetchError};
use crate::storage::{Database, NewSyncRun, SyncRunStatus};

/// Errors that end a sync run.
///
/// Every one of these results in a `failed` ledger entry. Pages committed
/// before the failure stay in the cache.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid sync request: {0}")]
    InvalidRequest(String),
    /// Feed request failed (network, status, timeout, envelope)
    #[error("Feed error: {0}")]
    Fetch(#[from] FetchError),
    /// Cache store insert/update failed
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("sync cancelled")]
    Cancelled,
}

/// Terminal result of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    /// `new_count + updated_count`
    pub total_synced: u64,
    pub new_count: u64,
    pub updated_count: u64,
    /// Malformed or duplicate items dropped from fetched pages
    pub skipped: u64,
    /// `new_count + updated_count + skipped`
    pub items_processed: u64,
    pub pages_fetched: u32,
    pub estimated_total: u64,
    pub duration_ms: u64,
    pub next_start_page: Option<u32>,
    pub remaining_pages: u32,
    pub has_more_pages: bool,
    /// A page came back shorter than the page size
    pub ended_naturally: bool,
}

/// Running totals, kept outside the page loop so a failed run can still
/// record what it got through.
#[derive(Debug, Default)]
struct RunTotals {
    phase: Option<RunPhase>,
    pages_fetched: u32,
    current_page: u32,
    total_pages: u32,
    raw_seen: u64,
    new_count: u64,
    updated_count: u64,
    skipped: u64,
    estimated_total: Option<u64>,
}

impl RunTotals {
    fn enter(&mut self, phase: RunPhase) {
        tracing::trace!(from = ?self.phase, to = ?phase, "Sync phase transition");
        self.phase = Some(phase);
    }

    fn items_processed(&self) -> u64 {
        self.new_count + self.updated_count + self.skipped
    }

    fn snapshot(&self, message: impl Into<String>) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: self.phase.unwrap_or(RunPhase::Idle),
            current_page: self.current_page,
            total_pages: self.total_pages,
            items_processed: self.items_processed(),
            new_count: self.new_count,
            updated_count: self.updated_count,
            status_message: message.into(),
            estimated_total: self.estimated_total,
        }
    }
}

/// The synchronization core: one implementation behind both the polling
/// ([`SyncEngine::sync`]) and streaming ([`SyncEngine::sync_stream`]) entry points.
#[derive(Clone)]
pub struct SyncEngine {
    db: Database,
    client: FeedClient,
    reconciler: Option<ImportStatusReconciler>,
}

impl SyncEngine {
    pub fn new(db: Database, client: FeedClient) -> Self {
        Self {
            db,
            client,
            reconciler: None,
        }
    }

    /// Enable import-status reconciliation after each page.
    pub fn with_reconciler(mut self, reconciler: ImportStatusReconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ========================================================================
    // Transports
    // ========================================================================

    /// Polling transport: run to the end of the window and return the summary.
    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncSummary, SyncError> {
        self.run(request, &ProgressReporter::silent(), &CancellationToken::new())
            .await
    }

    /// Streaming transport: run in the background and deliver progress.
    ///
    /// The receiver yields best-effort `Progress` events and then exactly
    /// one terminal `Completed`/`Failed` event. The join handle resolves to
    /// the same result as the polling transport.
    pub fn sync_stream(
        &self,
        request: SyncRequest,
        buffer: usize,
        cancel: CancellationToken,
    ) -> (
        mpsc::Receiver<SyncEvent>,
        JoinHandle<Result<SyncSummary, SyncError>>,
    ) {
        let (reporter, rx) = ProgressReporter::channel(buffer);
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            let result = engine.run(&request, &reporter, &cancel).await;

            // Terminal event waits for room: the writes are already done,
            // so nothing is held up by a slow consumer here.
            if let Some(tx) = reporter.sender() {
                let event = match &result {
                    Ok(summary) => SyncEvent::Completed(summary.clone()),
                    Err(e) => SyncEvent::Failed {
                        message: e.to_string(),
                    },
                };
                if tx.send(event).await.is_err() {
                    tracing::debug!("Sync stream consumer gone before terminal event");
                }
            }
            result
        });

        (rx, handle)
    }

    /// Drive consecutive windows until the job has no pages left, returning
    /// the combined summary. Each window is its own run with its own ledger entry.
    ///
    /// `cancel` is handed to every window and checked between windows.
    pub async fn sync_all(
        &self,
        request: &SyncRequest,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let mut request = request.clone();
        let mut combined = SyncSummary::default();

        loop {
            let summary = self.run(&request, reporter, cancel).await?;
            combined.total_synced += summary.total_synced;
            combined.new_count += summary.new_count;
            combined.updated_count += summary.updated_count;
            combined.skipped += summary.skipped;
            combined.items_processed += summary.items_processed;
            combined.pages_fetched += summary.pages_fetched;
            combined.duration_ms += summary.duration_ms;
            combined.estimated_total = summary.estimated_total;
            combined.ended_naturally = summary.ended_naturally;

            match summary.next_start_page {
                Some(next) if summary.has_more_pages && next > request.start_page => {
                    if cancel.is_cancelled() {
                        tracing::info!(
                            next_start_page = next,
                            synced = combined.total_synced,
                            "Sync cancelled between windows"
                        );
                        return Err(SyncError::Cancelled);
                    }
                    tracing::info!(
                        next_start_page = next,
                        remaining = summary.remaining_pages,
                        "Continuing with next window"
                    );
                    request.start_page = next;
                }
                _ => break,
            }
        }

        Ok(combined)
    }

    // ========================================================================
    // Core
    // ========================================================================

    /// Execute one invocation and append its ledger entry.
    ///
    /// Pages are processed strictly one after another. `cancel` is checked
    /// before each page fetch; already committed pages are kept.
    pub async fn run(
        &self,
        request: &SyncRequest,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let started = Instant::now();
        let mut totals = RunTotals::default();
        totals.enter(RunPhase::Idle);

        let result = self.execute(request, reporter, cancel, &mut totals).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        totals.enter(RunPhase::Finalizing);
        self.record_run(request, &totals, duration_ms, result.as_ref().err())
            .await;

        match result {
            Ok(plan_state) => {
                let summary = summarize(&totals, plan_state, duration_ms);
                totals.enter(RunPhase::Completed);
                reporter.report(totals.snapshot(format!(
                    "Sync complete: {} new, {} updated",
                    summary.new_count, summary.updated_count
                )));
                tracing::info!(
                    site = %request.site_id,
                    mode = %request.mode,
                    new = summary.new_count,
                    updated = summary.updated_count,
                    skipped = summary.skipped,
                    duration_ms = duration_ms,
                    has_more = summary.has_more_pages,
                    "Sync run completed"
                );
                Ok(summary)
            }
            Err(e) => {
                totals.enter(RunPhase::Failed);
                reporter.report(totals.snapshot(format!("Sync failed: {e}")));
                tracing::warn!(
                    site = %request.site_id,
                    mode = %request.mode,
                    page = totals.current_page,
                    error = %e,
                    "Sync run failed"
                );
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        request: &SyncRequest,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
        totals: &mut RunTotals,
    ) -> Result<PlanState, SyncError> {
        request.validate().map_err(SyncError::InvalidRequest)?;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let client = if request.site_id == self.client.site_id() {
            self.client.clone()
        } else {
            self.client.for_site(&request.site_id)
        };
        let page_size = client.page_size();

        totals.enter(RunPhase::Estimating);
        let estimate = estimate_total(&client, request.effective_order()).await?;
        totals.estimated_total = Some(estimate.exact_total);
        reporter.report(totals.snapshot(format!(
            "Feed has {} items across {} pages",
            estimate.exact_total, estimate.total_pages
        )));

        totals.enter(RunPhase::Planning);
        let cache_size = self
            .db
            .count_cached()
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        let cache_size = u64::try_from(cache_size).unwrap_or(0);
        let plan = plan(request, &estimate, cache_size);
        totals.total_pages = plan.total_pages;
        reporter.report(totals.snapshot(planning_message(&plan)));
        tracing::info!(
            site = %request.site_id,
            mode = %plan.mode,
            order_by = %plan.order_by,
            first_page = plan.first_page,
            last_page = plan.last_page,
            total_pages = plan.total_pages,
            new_items = ?plan.new_items,
            "Sync planned"
        );

        let mut ended_naturally = false;

        for page in plan.first_page..=plan.last_page {
            if cancel.is_cancelled() {
                tracing::info!(page = page, "Sync cancelled before page fetch");
                return Err(SyncError::Cancelled);
            }
            totals.current_page = page;

            totals.enter(RunPhase::Fetching);
            let mut parsed = client.fetch_page(page, plan.order_by).await?;
            let raw_len = parsed.raw_len;

            let take = plan.take_for_page(page, totals.raw_seen, parsed.items.len());
            if take < parsed.items.len() {
                tracing::debug!(
                    page = page,
                    keep = take,
                    fetched = parsed.items.len(),
                    "Slicing final incremental page"
                );
                parsed.items.truncate(take);
            }
            totals.raw_seen += raw_len as u64;

            totals.enter(RunPhase::Persisting);
            let now = Utc::now().timestamp();
            let outcome = self
                .db
                .upsert_page(&parsed.items, now)
                .await
                .map_err(|e| SyncError::Persistence(e.to_string()))?;
            totals.pages_fetched += 1;
            totals.new_count += outcome.inserted as u64;
            totals.updated_count += outcome.updated as u64;
            totals.skipped += parsed.skipped as u64;

            totals.enter(RunPhase::Reconciling);
            if let Some(reconciler) = &self.reconciler {
                let ids: Vec<String> = parsed
                    .items
                    .iter()
                    .map(|item| item.external_id.clone())
                    .collect();
                if let Err(e) = reconciler.reconcile(&self.db, &ids, now).await {
                    tracing::warn!(
                        page = page,
                        platform = %reconciler.platform_tag(),
                        error = %e,
                        "Import status reconciliation failed, continuing"
                    );
                }
            }

            tracing::info!(
                page = page,
                total_pages = plan.total_pages,
                new = outcome.inserted,
                updated = outcome.updated,
                skipped = parsed.skipped,
                "Page synced"
            );
            reporter.report(totals.snapshot(format!(
                "Page {}/{} synced: {} new, {} updated",
                page, plan.total_pages, outcome.inserted, outcome.updated
            )));

            if raw_len < page_size as usize {
                tracing::info!(page = page, fetched = raw_len, "Reached end of feed");
                ended_naturally = true;
                break;
            }
        }

        Ok(PlanState {
            next_start_page: plan.next_start_page,
            remaining_pages: plan.remaining_pages,
            ended_naturally,
        })
    }

    async fn record_run(
        &self,
        request: &SyncRequest,
        totals: &RunTotals,
        duration_ms: u64,
        error: Option<&SyncError>,
    ) {
        let run = NewSyncRun {
            status: if error.is_some() {
                SyncRunStatus::Failed
            } else {
                SyncRunStatus::Success
            },
            mode: request.mode.as_str().to_string(),
            site_id: request.site_id.clone(),
            order_by: request.effective_order().as_str().to_string(),
            start_page: i64::from(request.start_page),
            max_pages: request.max_pages.map(i64::from),
            items_seen: to_i64(totals.items_processed()),
            new_count: to_i64(totals.new_count),
            updated_count: to_i64(totals.updated_count),
            skipped_count: to_i64(totals.skipped),
            duration_ms: to_i64(duration_ms),
            error_message: error.map(|e| e.to_string()),
            created_at: Utc::now().timestamp(),
        };

        // A lost audit row must not turn a good run into a failed one
        if let Err(e) = self.db.record_sync_run(&run).await {
            tracing::warn!(
                error = %e,
                status = run.status.as_str(),
                "Failed to append sync ledger entry"
            );
        }
    }
}

/// Resumption data carried from the page loop to the summary.
#[derive(Debug)]
struct PlanState {
    next_start_page: Option<u32>,
    remaining_pages: u32,
    ended_naturally: bool,
}

fn summarize(totals: &RunTotals, state: PlanState, duration_ms: u64) -> SyncSummary {
    let (next_start_page, remaining_pages) = if state.ended_naturally {
        (None, 0)
    } else {
        (state.next_start_page, state.remaining_pages)
    };

    SyncSummary {
        total_synced: totals.new_count + totals.updated_count,
        new_count: totals.new_count,
        updated_count: totals.updated_count,
        skipped: totals.skipped,
        items_processed: totals.items_processed(),
        pages_fetched: totals.pages_fetched,
        estimated_total: totals.estimated_total.unwrap_or(0),
        duration_ms,
        next_start_page,
        remaining_pages,
        has_more_pages: next_start_page.is_some(),
        ended_naturally: state.ended_naturally,
    }
}

fn planning_message(plan: &SyncPlan) -> String {
    match (plan.mode, plan.new_items) {
        (SyncMode::Incremental, Some(0)) => "Cache is up to date".to_string(),
        (SyncMode::Incremental, Some(n)) => format!(
            "{} new items, fetching pages {}-{} of {}",
            n, plan.first_page, plan.last_page, plan.total_pages
        ),
        _ if plan.is_empty() => "No pages in this window".to_string(),
        _ => format!(
            "Fetching pages {}-{} of {}",
            plan.first_page, plan.last_page, plan.total_pages
        ),
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::OrderBy;

    #[test]
    fn test_summarize_natural_end_clears_resume() {
        let totals = RunTotals {
            new_count: 3,
            updated_count: 2,
            skipped: 1,
            pages_fetched: 1,
            ..Default::default()
        };
        let summary = summarize(
            &totals,
            PlanState {
                next_start_page: Some(2),
                remaining_pages: 4,
                ended_naturally: true,
            },
            10,
        );
        assert_eq!(summary.total_synced, 5);
        assert_eq!(summary.items_processed, 6);
        assert_eq!(summary.next_start_page, None);
        assert_eq!(summary.remaining_pages, 0);
        assert!(!summary.has_more_pages);
    }

    #[test]
    fn test_summarize_window_has_more() {
        let summary = summarize(
            &RunTotals::default(),
            PlanState {
                next_start_page: Some(2),
                remaining_pages: 1,
                ended_naturally: false,
            },
            10,
        );
        assert!(summary.has_more_pages);
        assert_eq!(summary.next_start_page, Some(2));
        assert_eq!(summary.remaining_pages, 1);
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let json = serde_json::to_value(SyncSummary {
            next_start_page: Some(2),
            has_more_pages: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json["nextStartPage"], 2);
        assert_eq!(json["hasMorePages"], true);
        assert_eq!(json["totalSynced"], 0);
    }

    #[test]
    fn test_planning_message() {
        let base = SyncPlan {
            mode: SyncMode::Incremental,
            order_by: OrderBy::Published,
            first_page: 1,
            last_page: 0,
            total_pages: 0,
            new_items: Some(0),
            next_start_page: None,
            remaining_pages: 0,
        };
        assert_eq!(planning_message(&base), "Cache is up to date");

        let full = SyncPlan {
            mode: SyncMode::Full,
            new_items: None,
            last_page: 3,
            total_pages: 3,
            ..base
        };
        assert_eq!(planning_message(&full), "Fetching pages 1-3 of 3");
    }
}
