use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use url::Url;

use crate::storage::FeedItem;

/// One feed page after best-effort item parsing.
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    /// Well-formed items, in feed order, with distinct ids
    pub items: Vec<FeedItem>,
    /// Items dropped because a field was missing or malformed, or the id repeated
    pub skipped: usize,
    /// Number of entries in the page's `items` array before filtering
    pub raw_len: usize,
    /// Highest page number advertised by `last_page_url`
    pub last_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PageEnvelope {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    last_page_url: Option<String>,
}

/// JSON scalar as the feed actually sends it: numbers sometimes arrive quoted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(alias = "external_id", alias = "md5")]
    id: Scalar,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default, alias = "quality")]
    quality_score: Option<Scalar>,
    #[serde(default, alias = "thumbnail", alias = "thumb_url")]
    thumb: Option<String>,
    #[serde(default, alias = "game_url")]
    url: Option<String>,
    #[serde(default)]
    width: Option<Scalar>,
    #[serde(default)]
    height: Option<Scalar>,
    #[serde(default)]
    orientation: Option<String>,
    #[serde(default, alias = "published_at", alias = "firstPublished")]
    published: Option<Scalar>,
    #[serde(default, alias = "modified_at", alias = "lastUpdated")]
    modified: Option<Scalar>,
}

/// Parse a feed page body.
///
/// The envelope must be valid JSON; individual items are parsed one at a
/// time and any item that fails is counted in `skipped` instead of failing
/// the page.
pub fn parse_page(bytes: &[u8]) -> Result<ParsedPage, serde_json::Error> {
    let envelope: PageEnvelope = serde_json::from_slice(bytes)?;
    let raw_len = envelope.items.len();
    let last_page = envelope.last_page_url.as_deref().and_then(last_page_number);

    let mut seen = HashSet::with_capacity(raw_len);
    let mut items = Vec::with_capacity(raw_len);
    let mut skipped = 0;

    for value in envelope.items {
        match parse_item(value) {
            Some(item) if seen.insert(item.external_id.clone()) => items.push(item),
            Some(item) => {
                tracing::debug!(external_id = %item.external_id, "Duplicate id within page, skipping");
                skipped += 1;
            }
            None => skipped += 1,
        }
    }

    Ok(ParsedPage {
        items,
        skipped,
        raw_len,
        last_page,
    })
}

fn parse_item(value: serde_json::Value) -> Option<FeedItem> {
    let raw: RawItem = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(error = %e, "Malformed feed item, skipping");
            return None;
        }
    };

    let external_id = match raw.id {
        Scalar::Int(n) => n.to_string(),
        Scalar::Text(s) => s.trim().to_string(),
        Scalar::Float(_) => return None,
    };
    let title = raw.title.trim().to_string();
    if external_id.is_empty() || title.is_empty() {
        tracing::debug!(external_id = %external_id, "Feed item without id or title, skipping");
        return None;
    }

    let item = FeedItem {
        external_id,
        title,
        description: non_empty(raw.description),
        category: non_empty(raw.category),
        quality_score: optional(raw.quality_score, as_f64)?,
        thumb_url: non_empty(raw.thumb),
        game_url: non_empty(raw.url),
        width: optional(raw.width, as_i64)?,
        height: optional(raw.height, as_i64)?,
        orientation: non_empty(raw.orientation).map(|o| o.to_lowercase()),
        published_at: optional(raw.published, as_timestamp)?,
        modified_at: optional(raw.modified, as_timestamp)?,
    };
    Some(item)
}

/// Convert a present field, distinguishing "absent" (`Some(None)`) from
/// "present but malformed" (`None`, which rejects the item).
fn optional<T>(value: Option<Scalar>, convert: fn(Scalar) -> Option<T>) -> Option<Option<T>> {
    match value {
        None => Some(None),
        Some(Scalar::Text(s)) if s.trim().is_empty() => Some(None),
        Some(v) => convert(v).map(Some),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn as_f64(value: Scalar) -> Option<f64> {
    let parsed: Option<f64> = match value {
        Scalar::Int(n) => Some(n as f64),
        Scalar::Float(f) => Some(f),
        Scalar::Text(s) => s.trim().parse().ok(),
    };
    parsed.filter(|f| f.is_finite())
}

fn as_i64(value: Scalar) -> Option<i64> {
    match value {
        Scalar::Int(n) => Some(n),
        Scalar::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(f as i64),
        Scalar::Float(_) => None,
        Scalar::Text(s) => s.trim().parse().ok(),
    }
}

/// Accepts epoch seconds, RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD` (UTC).
fn as_timestamp(value: Scalar) -> Option<i64> {
    match value {
        Scalar::Int(n) => Some(n),
        Scalar::Float(_) => None,
        Scalar::Text(s) => parse_timestamp(s.trim()),
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive).timestamp());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive).timestamp());
    }
    s.parse().ok()
}

/// Extract the `page` query parameter from a feed's `last_page_url`.
///
/// Relative URLs are resolved against a placeholder base; anything without
/// a positive integer `page` yields `None`.
pub fn last_page_number(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => Url::parse("http://feed.invalid/").ok()?.join(raw).ok()?,
    };
    url.query_pairs()
        .find(|(key, _)| key == "page")
        .and_then(|(_, value)| value.parse::<u32>().ok())
        .filter(|page| *page >= 1)
}
