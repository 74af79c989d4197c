use serde::Serialize;

use crate::feed::client::{FeedClient, FetchError, OrderBy};

/// Size of the upstream feed as inferred from its pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEstimate {
    pub total_pages: u32,
    pub exact_total: u64,
    pub page_size: u32,
}

/// Derive the exact item count of the feed.
///
/// The feed never reports a total, only a `last_page_url`. Page 1 tells us
/// how many pages exist; the last page tells us how full it is:
/// `exact_total = (total_pages - 1) * page_size + last_page_len`.
///
/// An empty feed (or one without `last_page_url`) is treated as a single page.
pub async fn estimate_total(
    client: &FeedClient,
    order_by: OrderBy,
) -> Result<FeedEstimate, FetchError> {
    let page_size = client.page_size();
    let first = client.fetch_page(1, order_by).await?;
    let total_pages = first.last_page.unwrap_or(1).max(1);

    let last_page_len = if total_pages > 1 {
        client.fetch_page(total_pages, order_by).await?.raw_len
    } else {
        first.raw_len
    };

    let exact_total =
        u64::from(total_pages - 1) * u64::from(page_size) + last_page_len as u64;

    tracing::info!(
        site = %client.site_id(),
        total_pages = total_pages,
        exact_total = exact_total,
        "Estimated feed size"
    );

    Ok(FeedEstimate {
        total_pages,
        exact_total,
        page_size,
    })
}
