use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::feed::parser::{parse_page, ParsedPage};

/// Largest page the feed will serve
pub const MAX_PAGE_SIZE: u32 = 96;

const MAX_PAGE_BYTES: usize = 10 * 1024 * 1024; // 10MB
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while reading a feed page.
///
/// None of these are retried here; retry policy belongs to whoever
/// triggers the sync.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Page body was not a valid feed envelope
    #[error("Parse error: {0}")]
    Parse(String),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// The configured feed URL could not be used
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),
}

/// Sort order requested from the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderBy {
    #[default]
    Quality,
    Published,
}

impl OrderBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderBy::Quality => "quality",
            OrderBy::Published => "published",
        }
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quality" => Ok(OrderBy::Quality),
            "published" => Ok(OrderBy::Published),
            other => Err(format!(
                "unknown ordering '{other}' (expected 'quality' or 'published')"
            )),
        }
    }
}

/// Paginated reader for the upstream catalog feed.
///
/// Requests look like
/// `GET <base>?site=<id>&page=<n>&perPage=<size>&orderBy=<order>&format=json`.
#[derive(Debug, Clone)]
pub struct FeedClient {
    http: reqwest::Client,
    base_url: Url,
    site_id: String,
    page_size: u32,
    timeout: Duration,
}

impl FeedClient {
    /// Create a client for one site. `page_size` is clamped to `1..=96`.
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        site_id: impl Into<String>,
        page_size: u32,
    ) -> Result<Self, FetchError> {
        let base_url = Url::parse(base_url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                base_url.scheme()
            )));
        }
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

        Ok(Self {
            http,
            base_url,
            site_id: site_id.into(),
            page_size,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the per-request timeout (default 30 seconds).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Same client pointed at a different site.
    pub fn for_site(&self, site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            ..self.clone()
        }
    }

    /// Build the request URL for one page.
    pub fn page_url(&self, page: u32, order_by: OrderBy) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("site", &self.site_id)
            .append_pair("page", &page.to_string())
            .append_pair("perPage", &self.page_size.to_string())
            .append_pair("orderBy", order_by.as_str())
            .append_pair("format", "json");
        url
    }

    /// Fetch and parse one page (1-based).
    ///
    /// Malformed items are dropped and counted in [`ParsedPage::skipped`];
    /// only transport, status and envelope failures are errors.
    pub async fn fetch_page(&self, page: u32, order_by: OrderBy) -> Result<ParsedPage, FetchError> {
        let url = self.page_url(page, order_by);
        tracing::debug!(site = %self.site_id, page = page, order_by = %order_by, "Fetching feed page");

        let response = tokio::time::timeout(self.timeout, self.http.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let bytes = tokio::time::timeout(self.timeout, read_limited_bytes(response, MAX_PAGE_BYTES))
            .await
            .map_err(|_| FetchError::Timeout)??;

        let parsed = parse_page(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
        if parsed.skipped > 0 {
            tracing::warn!(
                site = %self.site_id,
                page = page,
                skipped = parsed.skipped,
                "Malformed feed items skipped"
            );
        }
        Ok(parsed)
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> FeedClient {
        FeedClient::new(
            reqwest::Client::new(),
            &format!("{}/feed", server.uri()),
            "site-1",
            96,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_page_sends_contract_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(query_param("site", "site-1"))
            .and(query_param("page", "3"))
            .and(query_param("perPage", "96"))
            .and(query_param("orderBy", "published"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"id": "a", "title": "A"}, {"id": "b", "title": "B"}],
                "last_page_url": format!("{}/feed?page=9", server.uri()),
            })))
            .expect(1)
            .mount(&server)
            .await;

        let page = client_for(&server)
            .fetch_page(3, OrderBy::Published)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.raw_len, 2);
        assert_eq!(page.last_page, Some(9));
    }

    #[tokio::test]
    async fn test_fetch_page_http_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch_page(1, OrderBy::Quality)
            .await
            .unwrap_err();
        match err {
            FetchError::HttpStatus(503) => {}
            e => panic!("Expected HttpStatus(503), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_fetch_page_invalid_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch_page(1, OrderBy::Quality)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }

    #[tokio::test]
    async fn test_fetch_page_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"items": []}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .with_timeout(Duration::from_millis(50))
            .fetch_page(1, OrderBy::Quality)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout));
    }

    #[test]
    fn test_page_size_is_clamped() {
        let client =
            FeedClient::new(reqwest::Client::new(), "https://feed.example.com/api", "s", 500)
                .unwrap();
        assert_eq!(client.page_size(), MAX_PAGE_SIZE);

        let client =
            FeedClient::new(reqwest::Client::new(), "https://feed.example.com/api", "s", 0).unwrap();
        assert_eq!(client.page_size(), 1);
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            FeedClient::new(reqwest::Client::new(), "not a url", "s", 96),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            FeedClient::new(reqwest::Client::new(), "ftp://feed.example.com", "s", 96),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_page_url_keeps_existing_query() {
        let client = FeedClient::new(
            reqwest::Client::new(),
            "https://feed.example.com/api?key=k",
            "s 1",
            48,
        )
        .unwrap();
        let url = client.page_url(2, OrderBy::Quality);
        assert_eq!(
            url.as_str(),
            "https://feed.example.com/api?key=k&site=s+1&page=2&perPage=48&orderBy=quality&format=json"
        );
    }

    #[test]
    fn test_order_by_from_str() {
        assert_eq!("Published".parse::<OrderBy>(), Ok(OrderBy::Published));
        assert_eq!("quality".parse::<OrderBy>(), Ok(OrderBy::Quality));
        assert!("newest".parse::<OrderBy>().is_err());
    }
}
