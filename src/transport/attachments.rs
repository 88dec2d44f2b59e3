//! Streaming attachment retrieval to durable local storage.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use super::TransportError;

#[async_trait]
pub trait AttachmentFetch: Send + Sync {
    /// Stream the content at `url` to `dest`. Callers treat failures as
    /// non-fatal; a failed download is logged and skipped.
    async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, TransportError>;
}

pub struct AttachmentFetcher {
    client: reqwest::Client,
}

impl AttachmentFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for AttachmentFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AttachmentFetch for AttachmentFetcher {
    async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Api {
                code: Some(response.status().to_string()),
                message: format!("failed to download {url}"),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::Network(e.to_string()))?;
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransportError::Network(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransportError::Network(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(written)
    }
}

/// Best-effort basename for naming downloaded attachments; strips query
/// strings from CDN urls.
pub fn url_basename(url: &str) -> String {
    let no_query = url.split(['?', '#']).next().unwrap_or(url);
    no_query
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("attachment")
        .to_string()
}
