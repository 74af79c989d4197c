use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::feed::{FeedEstimate, OrderBy};

/// Extra items kept on the last page of an incremental run, covering items
/// published between size estimation and the fetch.
pub const BOUNDARY_BUFFER: u64 = 5;

/// Which pages a run walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Re-walk every page of the feed
    #[default]
    Full,
    /// Fetch only as many newest-first pages as the cache is behind by
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(format!(
                "unknown sync mode '{other}' (expected 'full' or 'incremental')"
            )),
        }
    }
}

/// Parameters of one sync invocation.
///
/// `start_page`/`max_pages` form the resumable window: a caller with a
/// bounded time budget runs one window, then resumes from the returned
/// `next_start_page`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub mode: SyncMode,
    pub site_id: String,
    pub order_by: OrderBy,
    /// 1-based first page of the window
    pub start_page: u32,
    /// Page budget for this invocation; `None` runs to the end
    pub max_pages: Option<u32>,
}

impl SyncRequest {
    pub fn new(mode: SyncMode, site_id: impl Into<String>) -> Self {
        Self {
            mode,
            site_id: site_id.into(),
            order_by: OrderBy::default(),
            start_page: 1,
            max_pages: None,
        }
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn window(mut self, start_page: u32, max_pages: Option<u32>) -> Self {
        self.start_page = start_page;
        self.max_pages = max_pages;
        self
    }

    /// Ordering actually sent to the feed. Incremental runs rely on the
    /// newest items surfacing first, so they always use published order.
    pub fn effective_order(&self) -> OrderBy {
        match self.mode {
            SyncMode::Full => self.order_by,
            SyncMode::Incremental => OrderBy::Published,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.site_id.trim().is_empty() {
            return Err("site id must not be empty".to_string());
        }
        if self.start_page == 0 {
            return Err("start page is 1-based".to_string());
        }
        if self.max_pages == Some(0) {
            return Err("max pages must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Page range and resumption data for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub mode: SyncMode,
    pub order_by: OrderBy,
    /// First page to fetch (inclusive)
    pub first_page: u32,
    /// Last page to fetch (inclusive); below `first_page` when there is nothing to do
    pub last_page: u32,
    /// Last page of the whole job, across all windows
    pub total_pages: u32,
    /// Incremental only: items still missing from the cache, counted from `first_page`
    pub new_items: Option<u64>,
    pub next_start_page: Option<u32>,
    pub remaining_pages: u32,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.first_page > self.last_page
    }

    pub fn page_count(&self) -> u32 {
        if self.is_empty() {
            0
        } else {
            self.last_page - self.first_page + 1
        }
    }

    /// How many parsed items of `page` to keep.
    ///
    /// Only the job's final page of an incremental run is sliced; `seen_before`
    /// is the number of feed items already walked in this window.
    pub fn take_for_page(&self, page: u32, seen_before: u64, page_len: usize) -> usize {
        match self.new_items {
            Some(needed) if page == self.total_pages => {
                boundary_take(needed.saturating_sub(seen_before), page_len)
            }
            _ => page_len,
        }
    }
}

/// Decide the page range for a request.
///
/// - full: pages `1..=total_pages`
/// - incremental: `new = max(0, exact_total - cache_size)` items, i.e.
///   `ceil(new / page_size)` pages of newest-first results
///
/// A resumed incremental window (`start_page > 1`) counts its pages from
/// `start_page`: the pages before it were mirrored by the earlier windows
/// and are already part of `cache_size`.
///
/// The window then clips to `start_page..=min(start_page + max_pages - 1, total)`.
pub fn plan(request: &SyncRequest, estimate: &FeedEstimate, cache_size: u64) -> SyncPlan {
    let page_size = u64::from(estimate.page_size.max(1));
    let first_page = request.start_page.max(1);

    let (total_pages, new_items) = match request.mode {
        SyncMode::Full => (estimate.total_pages, None),
        SyncMode::Incremental => {
            let new_items = estimate.exact_total.saturating_sub(cache_size);
            let pages_needed = u32::try_from(new_items.div_ceil(page_size)).unwrap_or(u32::MAX);
            let total = if pages_needed == 0 {
                0
            } else {
                (first_page - 1).saturating_add(pages_needed)
            };
            (total, Some(new_items))
        }
    };

    let last_page = match request.max_pages {
        Some(max) => first_page
            .saturating_add(max.saturating_sub(1))
            .min(total_pages),
        None => total_pages,
    };

    let (next_start_page, remaining_pages) = if first_page > total_pages {
        (None, 0)
    } else if last_page < total_pages {
        (Some(last_page + 1), total_pages - last_page)
    } else {
        (None, 0)
    };

    SyncPlan {
        mode: request.mode,
        order_by: request.effective_order(),
        first_page,
        last_page,
        total_pages,
        new_items,
        next_start_page,
        remaining_pages,
    }
}

/// Items to keep from a page when only `needed` new items remain.
///
/// `min(needed + 5, page_len)` when fewer than a full page is needed,
/// otherwise the whole page.
pub fn boundary_take(needed: u64, page_len: usize) -> usize {
    if needed < page_len as u64 {
        let with_buffer = needed.saturating_add(BOUNDARY_BUFFER);
        usize::try_from(with_buffer).unwrap_or(page_len).min(page_len)
    } else {
        page_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn estimate(total_pages: u32, exact_total: u64) -> FeedEstimate {
        FeedEstimate {
            total_pages,
            exact_total,
            page_size: 96,
        }
    }

    #[test]
    fn test_full_plan_covers_all_pages() {
        let request = SyncRequest::new(SyncMode::Full, "s").order_by(OrderBy::Quality);
        let plan = plan(&request, &estimate(3, 250), 0);

        assert_eq!(plan.first_page, 1);
        assert_eq!(plan.last_page, 3);
        assert_eq!(plan.total_pages, 3);
        assert_eq!(plan.order_by, OrderBy::Quality);
        assert_eq!(plan.new_items, None);
        assert_eq!(plan.next_start_page, None);
        assert_eq!(plan.remaining_pages, 0);
        assert_eq!(plan.page_count(), 3);
    }

    #[test]
    fn test_full_plan_window() {
        let request = SyncRequest::new(SyncMode::Full, "s").window(1, Some(1));
        let plan = plan(&request, &estimate(2, 100), 0);
        assert_eq!((plan.first_page, plan.last_page), (1, 1));
        assert_eq!(plan.next_start_page, Some(2));
        assert_eq!(plan.remaining_pages, 1);

        let request = SyncRequest::new(SyncMode::Full, "s").window(2, Some(1));
        let plan = super::plan(&request, &estimate(2, 100), 0);
        assert_eq!((plan.first_page, plan.last_page), (2, 2));
        assert_eq!(plan.next_start_page, None);
        assert_eq!(plan.remaining_pages, 0);
    }

    #[test]
    fn test_window_past_end_is_empty() {
        let request = SyncRequest::new(SyncMode::Full, "s").window(5, Some(3));
        let plan = plan(&request, &estimate(2, 100), 0);
        assert!(plan.is_empty());
        assert_eq!(plan.page_count(), 0);
        assert_eq!(plan.next_start_page, None);
        assert_eq!(plan.remaining_pages, 0);
    }

    #[test]
    fn test_incremental_plan() {
        let request = SyncRequest::new(SyncMode::Incremental, "s").order_by(OrderBy::Quality);
        let plan = plan(&request, &estimate(2, 100), 80);

        assert_eq!(plan.order_by, OrderBy::Published);
        assert_eq!(plan.new_items, Some(20));
        assert_eq!((plan.first_page, plan.last_page), (1, 1));
        assert_eq!(plan.total_pages, 1);
    }

    #[test]
    fn test_incremental_nothing_new() {
        let request = SyncRequest::new(SyncMode::Incremental, "s");
        let plan = plan(&request, &estimate(2, 100), 100);
        assert!(plan.is_empty());
        assert_eq!(plan.new_items, Some(0));

        // Cache larger than feed (items removed upstream)
        let plan = super::plan(&request, &estimate(2, 100), 150);
        assert!(plan.is_empty());
        assert_eq!(plan.new_items, Some(0));
    }

    #[test]
    fn test_incremental_resumed_window_offsets_pages() {
        // 150 new items at first: window 1 mirrors page 1 (96 items)
        let first = SyncRequest::new(SyncMode::Incremental, "s").window(1, Some(1));
        let plan1 = plan(&first, &estimate(4, 350), 200);
        assert_eq!(plan1.total_pages, 2);
        assert_eq!(plan1.next_start_page, Some(2));

        // After window 1 the cache holds 296; 54 items remain, on page 2
        let second = SyncRequest::new(SyncMode::Incremental, "s").window(2, Some(1));
        let plan2 = plan(&second, &estimate(4, 350), 296);
        assert_eq!((plan2.first_page, plan2.last_page), (2, 2));
        assert_eq!(plan2.new_items, Some(54));
        assert_eq!(plan2.next_start_page, None);
        assert_eq!(plan2.take_for_page(2, 0, 96), 59);
    }

    #[test]
    fn test_take_for_page() {
        let request = SyncRequest::new(SyncMode::Incremental, "s");
        let plan = plan(&request, &estimate(3, 300), 100); // 200 new -> 3 pages

        assert_eq!(plan.take_for_page(1, 0, 96), 96);
        assert_eq!(plan.take_for_page(2, 96, 96), 96);
        // 8 still needed on the final page -> 8 + 5
        assert_eq!(plan.take_for_page(3, 192, 96), 13);

        let full = super::plan(&SyncRequest::new(SyncMode::Full, "s"), &estimate(3, 300), 100);
        assert_eq!(full.take_for_page(3, 192, 12), 12);
    }

    #[test]
    fn test_boundary_take() {
        assert_eq!(boundary_take(20, 96), 25);
        assert_eq!(boundary_take(20, 22), 22);
        assert_eq!(boundary_take(96, 96), 96);
        assert_eq!(boundary_take(200, 96), 96);
        assert_eq!(boundary_take(0, 96), 5);
    }

    #[test]
    fn test_validate() {
        assert!(SyncRequest::new(SyncMode::Full, "s").validate().is_ok());
        assert!(SyncRequest::new(SyncMode::Full, " ").validate().is_err());
        assert!(SyncRequest::new(SyncMode::Full, "s")
            .window(0, None)
            .validate()
            .is_err());
        assert!(SyncRequest::new(SyncMode::Full, "s")
            .window(1, Some(0))
            .validate()
            .is_err());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("FULL".parse::<SyncMode>(), Ok(SyncMode::Full));
        assert_eq!("incremental".parse::<SyncMode>(), Ok(SyncMode::Incremental));
        assert!("partial".parse::<SyncMode>().is_err());
    }

    proptest! {
        #[test]
        fn prop_window_stays_within_feed(
            total in 1u32..500,
            start in 1u32..600,
            max in proptest::option::of(1u32..50),
        ) {
            let request = SyncRequest::new(SyncMode::Full, "s").window(start, max);
            let plan = plan(&request, &estimate(total, u64::from(total) * 96), 0);

            if plan.is_empty() {
                prop_assert!(start > total);
                prop_assert_eq!(plan.remaining_pages, 0);
            } else {
                prop_assert!(plan.first_page >= 1);
                prop_assert!(plan.last_page <= total);
                if let Some(max) = max {
                    prop_assert!(plan.page_count() <= max);
                }
                prop_assert_eq!(plan.last_page + plan.remaining_pages, total);
                prop_assert_eq!(plan.next_start_page.is_some(), plan.remaining_pages > 0);
            }
        }

        #[test]
        fn prop_chained_windows_cover_every_page_once(total in 1u32..200, max in 1u32..20) {
            let mut covered = Vec::new();
            let mut start = 1;
            loop {
                let request = SyncRequest::new(SyncMode::Full, "s").window(start, Some(max));
                let plan = plan(&request, &estimate(total, 0), 0);
                covered.extend(plan.first_page..=plan.last_page);
                match plan.next_start_page {
                    Some(next) => start = next,
                    None => break,
                }
            }
            prop_assert_eq!(covered, (1..=total).collect::<Vec<_>>());
        }

        #[test]
        fn prop_boundary_take_never_below_needed(needed in 0u64..200, len in 0usize..=96) {
            let take = boundary_take(needed, len);
            prop_assert!(take <= len);
            prop_assert!(take as u64 >= needed.min(len as u64));
        }
    }
}
