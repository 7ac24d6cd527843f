use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::feed::read_limited_bytes;

const MAX_IMAGE_SIZE: usize = 20 * 1024 * 1024; // 20MB

/// Errors from a single image preload.
///
/// Always swallowed by the scheduler; prefetching is an optimization only.
#[derive(Debug, Error)]
pub enum PrefetchError {
    #[error("Image load timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Image load failed: {0}")]
    Failed(String),
}

/// Platform image-loading primitive: resolves once the resource is loaded.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<(), PrefetchError>;
}

/// Loads images over HTTP, reading the whole body so the CDN response ends up
/// in any caching layer between us and the media host.
pub struct HttpImageLoader {
    client: reqwest::Client,
}

impl HttpImageLoader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageLoader for HttpImageLoader {
    async fn load(&self, url: &str) -> Result<(), PrefetchError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(PrefetchError::HttpStatus(response.status().as_u16()));
        }
        let bytes = read_limited_bytes(response, MAX_IMAGE_SIZE)
            .await
            .map_err(|e| PrefetchError::Failed(e.to_string()))?;
        tracing::trace!(url = %url, bytes = bytes.len(), "Image loaded");
        Ok(())
    }
}
