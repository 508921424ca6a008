//! Browser-style "save as" of in-memory chunks.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::directory::DirectoryHandle;
use crate::error::{CaptureError, Result};

/// Destination for manual downloads of buffered streams.
#[async_trait]
pub trait DownloadTarget: Send + Sync {
    /// Save the concatenation of `chunks` as `filename`.
    async fn save(&self, filename: &str, chunks: &[Bytes]) -> Result<u64>;
}

/// Saves downloads as whole files inside a directory.
pub struct DirectoryDownloads {
    directory: Arc<dyn DirectoryHandle>,
}

impl DirectoryDownloads {
    pub fn new(directory: Arc<dyn DirectoryHandle>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl DownloadTarget for DirectoryDownloads {
    async fn save(&self, filename: &str, chunks: &[Bytes]) -> Result<u64> {
        let handle = self
            .directory
            .get_file_handle(filename, true)
            .await
            .map_err(|e| CaptureError::download(format!("{filename}: {e}")))?;
        let mut writable = handle
            .create_writable(false)
            .await
            .map_err(|e| CaptureError::download(format!("{filename}: {e}")))?;

        let mut position = 0u64;
        for chunk in chunks {
            writable.write_at(position, chunk).await?;
            position += chunk.len() as u64;
        }
        writable.close().await?;

        info!(file = %filename, bytes = position, "Download saved");
        Ok(position)
    }
}
