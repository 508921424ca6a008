//! Ordered persistence sinks and their writer tasks.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::directory::WritableFile;
use crate::error::{CaptureError, Result};

/// Reservation of a file name inside a grant. Released on drop.
pub(crate) struct NameClaim {
    names: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl NameClaim {
    /// Claim `name`, or `None` when another sink already holds it.
    pub(crate) fn acquire(names: &Arc<Mutex<HashSet<String>>>, name: &str) -> Option<Self> {
        if !names.lock().insert(name.to_owned()) {
            return None;
        }
        Some(Self {
            names: Arc::clone(names),
            name: name.to_owned(),
        })
    }
}

impl Drop for NameClaim {
    fn drop(&mut self) {
        self.names.lock().remove(&self.name);
    }
}

/// Exclusively owned writable destination accepting only in-order writes.
///
/// Every write must start exactly at the current cursor, so bytes land in
/// the order they were produced with no gaps and no overlap.
pub struct PersistenceSink {
    name: String,
    file: Box<dyn WritableFile>,
    cursor: u64,
    closed: bool,
    _claim: Option<NameClaim>,
}

impl PersistenceSink {
    pub fn new(name: impl Into<String>, file: Box<dyn WritableFile>) -> Self {
        Self {
            name: name.into(),
            file,
            cursor: 0,
            closed: false,
            _claim: None,
        }
    }

    pub(crate) fn with_claim(mut self, claim: NameClaim) -> Self {
        self._claim = Some(claim);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next writable offset.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write `data` at `position`, which must equal the cursor.
    pub async fn write_at(&mut self, position: u64, data: &[u8]) -> Result<u64> {
        if self.closed {
            return Err(CaptureError::SinkClosed {
                name: self.name.clone(),
            });
        }
        if position != self.cursor {
            return Err(CaptureError::OutOfOrderWrite {
                name: self.name.clone(),
                expected: self.cursor,
                actual: position,
            });
        }
        self.file.write_at(position, data).await?;
        self.cursor += data.len() as u64;
        Ok(self.cursor)
    }

    /// Write `data` at the cursor.
    pub async fn append(&mut self, data: &[u8]) -> Result<u64> {
        self.write_at(self.cursor, data).await
    }

    /// Close the destination. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<u64> {
        if !self.closed {
            self.closed = true;
            self.file.close().await?;
            debug!(file = %self.name, bytes = self.cursor, "Sink closed");
        }
        Ok(self.cursor)
    }
}

enum SinkCommand {
    Write { position: u64, data: Bytes },
    Close(Option<oneshot::Sender<Result<u64>>>),
}

/// Handle to a sink owned by a dedicated writer task.
///
/// Commands are processed strictly in send order, so writes issued through
/// one handle reach the file in the order they were issued, and a close
/// lands after every write sent before it.
pub struct SinkHandle {
    name: String,
    tx: mpsc::UnboundedSender<SinkCommand>,
}

impl SinkHandle {
    /// Move `sink` into a writer task on `runtime`.
    pub fn spawn(runtime: &Handle, sink: PersistenceSink) -> Self {
        let name = sink.name().to_owned();
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_writer(sink, rx));
        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a write. Returns `false` when the writer is already gone, in
    /// which case the chunk is dropped.
    pub fn write(&self, position: u64, data: Bytes) -> bool {
        self.tx.send(SinkCommand::Write { position, data }).is_ok()
    }

    /// Close the sink after all queued writes and wait for it.
    pub async fn close(self) -> Result<u64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(SinkCommand::Close(Some(reply_tx))).is_err() {
            return Err(CaptureError::SinkClosed { name: self.name });
        }
        reply_rx
            .await
            .map_err(|_| CaptureError::SinkClosed { name: self.name })?
    }

    /// Close the sink after all queued writes without waiting.
    pub fn shutdown(self) {
        let _ = self.tx.send(SinkCommand::Close(None));
    }
}

async fn run_writer(mut sink: PersistenceSink, mut rx: mpsc::UnboundedReceiver<SinkCommand>) {
    let mut failed = false;

    while let Some(command) = rx.recv().await {
        match command {
            SinkCommand::Write { position, data } => {
                if failed {
                    continue;
                }
                if let Err(e) = sink.write_at(position, &data).await {
                    // The cursor no longer matches what the stream believes,
                    // anything after this would be misplaced.
                    warn!(file = %sink.name(), offset = position, error = %e, "Write failed, dropping further writes");
                    failed = true;
                }
            }
            SinkCommand::Close(reply) => {
                let result = sink.close().await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                } else if let Err(e) = result {
                    warn!(file = %sink.name(), error = %e, "Failed to close sink");
                }
                return;
            }
        }
    }

    // Every handle dropped without an explicit close.
    if let Err(e) = sink.close().await {
        warn!(file = %sink.name(), error = %e, "Failed to close abandoned sink");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryHandle, MemoryDirectory};

    async fn memory_sink(dir: &MemoryDirectory, name: &str) -> PersistenceSink {
        let handle = dir.get_file_handle(name, true).await.unwrap();
        let writable = handle.create_writable(false).await.unwrap();
        PersistenceSink::new(name, writable)
    }

    #[tokio::test]
    async fn test_sink_rejects_out_of_order_writes() {
        let dir = MemoryDirectory::new("t");
        let mut sink = memory_sink(&dir, "a").await;

        assert_eq!(sink.append(b"0123").await.unwrap(), 4);
        let err = sink.write_at(2, b"xx").await.unwrap_err();
        assert!(matches!(
            err,
            CaptureError::OutOfOrderWrite {
                expected: 4,
                actual: 2,
                ..
            }
        ));
        let err = sink.write_at(10, b"xx").await.unwrap_err();
        assert!(matches!(err, CaptureError::OutOfOrderWrite { .. }));

        assert_eq!(sink.write_at(4, b"45").await.unwrap(), 6);
        assert_eq!(dir.contents("a").unwrap(), b"012345");
    }

    #[tokio::test]
    async fn test_sink_closed_rejects_writes() {
        let dir = MemoryDirectory::new("t");
        let mut sink = memory_sink(&dir, "a").await;
        sink.append(b"ab").await.unwrap();
        assert_eq!(sink.close().await.unwrap(), 2);
        assert_eq!(sink.close().await.unwrap(), 2);
        assert!(sink.is_closed());
        assert!(matches!(
            sink.append(b"c").await,
            Err(CaptureError::SinkClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_handle_preserves_order_and_closes_last() {
        let dir = MemoryDirectory::new("t");
        let sink = memory_sink(&dir, "a").await;
        let handle = SinkHandle::spawn(&Handle::current(), sink);

        let mut offset = 0;
        for chunk in [&b"one"[..], b"two", b"three"] {
            assert!(handle.write(offset, Bytes::copy_from_slice(chunk)));
            offset += chunk.len() as u64;
        }
        assert_eq!(handle.close().await.unwrap(), 11);
        assert_eq!(dir.contents("a").unwrap(), b"onetwothree");
    }

    #[tokio::test]
    async fn test_handle_drops_writes_after_failure() {
        let dir = MemoryDirectory::new("t");
        let sink = memory_sink(&dir, "a").await;
        let handle = SinkHandle::spawn(&Handle::current(), sink);

        handle.write(5, Bytes::from_static(b"gap"));
        handle.write(0, Bytes::from_static(b"late"));
        assert_eq!(handle.close().await.unwrap(), 0);
        assert_eq!(dir.contents("a").unwrap(), b"");
    }

    #[test]
    fn test_name_claim_released_on_drop() {
        let names = Arc::new(Mutex::new(HashSet::new()));
        let claim = NameClaim::acquire(&names, "x").unwrap();
        assert!(NameClaim::acquire(&names, "x").is_none());
        drop(claim);
        assert!(NameClaim::acquire(&names, "x").is_some());
    }
}
