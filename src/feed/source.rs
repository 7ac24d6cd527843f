use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use url::Url;

use crate::model::{FilterSet, Page};

const MAX_PAGE_SIZE_BYTES: usize = 10 * 1024 * 1024; // 10MB
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while fetching a feed page.
///
/// Any of these is surfaced to the view as the feed's error state. None of
/// them is retried automatically; the user recovers with a refresh.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body was not a valid page document
    #[error("Parse error: {0}")]
    Parse(String),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Configured API base URL is unusable
    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),
    /// Source-specific failure outside the HTTP path
    #[error("{0}")]
    Other(String),
}

/// Data-access collaborator: paged reads of a filtered feed.
///
/// Must be idempotent for the same `(filters, page)` and must report
/// `has_more = false` once the feed is exhausted.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        filters: &FilterSet,
        page: u32,
        page_size: u32,
    ) -> Result<Page, FetchError>;
}

/// `PageSource` over the site's JSON API.
///
/// `GET {base}/memes?sort=..&period=..&category=..&page=..&page_size=..`
/// answering `{"items": [...], "has_more": bool}`.
pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpPageSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    fn page_url(&self, filters: &FilterSet, page: u32, page_size: u32) -> Result<Url, FetchError> {
        let endpoint = format!("{}/memes", self.base_url.trim_end_matches('/'));
        let mut url = Url::parse(&endpoint).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("sort", filters.sort_mode.as_str())
                .append_pair("period", filters.time_period.as_str());
            if let Some(category) = &filters.category_id {
                query.append_pair("category", category);
            }
            query
                .append_pair("page", &page.to_string())
                .append_pair("page_size", &page_size.to_string());
        }
        Ok(url)
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(
        &self,
        filters: &FilterSet,
        page: u32,
        page_size: u32,
    ) -> Result<Page, FetchError> {
        let url = self.page_url(filters, page, page_size)?;
        let mut request = self.client.get(url.as_str());
        if let Some(key) = &self.api_key {
            tracing::trace!("API authentication configured");
            request = request.header("Authorization", format!("Bearer {}", key.expose_secret()));
        }

        let response = tokio::time::timeout(REQUEST_TIMEOUT, request.send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        if !response.status().is_success() {
            tracing::warn!(
                url = %url,
                status = %response.status(),
                "Feed page request failed"
            );
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let bytes = read_limited_bytes(response, MAX_PAGE_SIZE_BYTES).await?;
        let page_doc: Page =
            serde_json::from_slice(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

        tracing::debug!(
            page = page,
            items = page_doc.items.len(),
            has_more = page_doc.has_more,
            "Fetched feed page"
        );
        Ok(page_doc)
    }
}

/// Read a response body, refusing anything over `limit` bytes.
pub(crate) async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
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

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
