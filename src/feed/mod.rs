//! Upstream catalog feed access.
//!
//! - [`client`] - paginated HTTP reads of the JSON feed
//! - [`parser`] - best-effort page parsing (malformed items are skipped, not fatal)
//! - [`estimator`] - infers the feed's exact size from its pagination metadata
//!
//! # Example
//!
//! ```ignore
//! use catalog_mirror::feed::{estimate_total, FeedClient, OrderBy};
//!
//! let client = FeedClient::new(reqwest::Client::new(), "https://feed.example.com/api", "site-1", 96)?;
//! let estimate = estimate_total(&client, OrderBy::Quality).await?;
//! let page = client.fetch_page(1, OrderBy::Quality).await?;
//! ```

mod client;
mod estimator;
mod parser;

pub use client::{FeedClient, FetchError, OrderBy, MAX_PAGE_SIZE};
pub use estimator::{estimate_total, FeedEstimate};
pub use parser::{last_page_number, parse_page, ParsedPage};
