//! HTTP block transport backed by reqwest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::UserId;

use super::{BlockDownloader, ProgressSink};

/// Streams blocks over HTTP(S), writing each chunk as it arrives
#[derive(Clone, Debug)]
pub struct HttpBlockDownloader {
    client: reqwest::Client,
}

impl HttpBlockDownloader {
    /// Create a downloader whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (shared connection pool, custom auth headers)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn stream_to_file(
        &self,
        url: &str,
        destination: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let mut file = tokio::fs::File::create(destination).await?;
        while let Some(chunk) = response.chunk().await? {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            file.write_all(&chunk).await?;
            progress.advance(chunk.len() as u64).await;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlockDownloader for HttpBlockDownloader {
    async fn download_url(
        &self,
        user_id: &UserId,
        url: &str,
        destination: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        url::Url::parse(url)
            .map_err(|e| Error::InvalidArgument(format!("invalid block url '{}': {}", url, e)))?;

        tracing::debug!(user_id = %user_id, url, ?destination, "fetching block");

        if let Err(e) = self.stream_to_file(url, destination, progress, cancel).await {
            if let Err(rm) = tokio::fs::remove_file(destination).await
                && rm.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(?destination, error = %rm, "failed to remove partial block");
            }
            return Err(e);
        }
        Ok(destination.to_path_buf())
    }
}
