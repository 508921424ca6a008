//! The user's directory grant and the sinks minted from it.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

use crate::directory::{DirectoryHandle, FileHandle};
use crate::error::{CaptureError, Result};
use crate::sink::{NameClaim, PersistenceSink};

/// Write capability on one directory.
///
/// File-handle creation goes through a FIFO lock: only one creation is in
/// flight at a time, later requests queue behind it. Only creation is
/// serialized, writes on the resulting sinks are independent.
pub struct DirectoryGrant {
    directory: Arc<dyn DirectoryHandle>,
    creation_lock: AsyncMutex<()>,
    open_names: Arc<Mutex<HashSet<String>>>,
}

impl DirectoryGrant {
    pub fn new(directory: Arc<dyn DirectoryHandle>) -> Self {
        Self {
            directory,
            creation_lock: AsyncMutex::new(()),
            open_names: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn location(&self) -> String {
        self.directory.location()
    }

    pub fn directory(&self) -> &Arc<dyn DirectoryHandle> {
        &self.directory
    }

    /// Create (or open) `name` inside the directory. Serialized across the grant.
    pub async fn file_handle(&self, name: &str) -> Result<Arc<dyn FileHandle>> {
        let _guard = match self.creation_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                trace!(file = %name, "File handle creation busy, queued");
                self.creation_lock.lock().await
            }
        };
        self.directory
            .get_file_handle(name, true)
            .await
            .map_err(|e| CaptureError::file_creation(name, e.to_string()))
    }

    /// Mint a sink on `name`.
    ///
    /// Fails when another live sink of this grant already targets the same
    /// name, so two streams never write one file concurrently.
    pub async fn open_sink(&self, name: &str, keep_existing_data: bool) -> Result<PersistenceSink> {
        let claim = NameClaim::acquire(&self.open_names, name)
            .ok_or_else(|| CaptureError::file_creation(name, "file is already being written"))?;

        let handle = self.file_handle(name).await?;
        let writable = handle
            .create_writable(keep_existing_data)
            .await
            .map_err(|e| CaptureError::file_creation(name, e.to_string()))?;

        debug!(file = %name, directory = %self.location(), "Sink opened");
        Ok(PersistenceSink::new(name, writable).with_claim(claim))
    }
}
