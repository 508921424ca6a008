//! The simulated player the captured tracks are replayed into.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use mediacache_engine::{HostError, MediaSource, SourceBuffer};

/// Media source accepting any track. Appended bytes are counted and discarded.
#[derive(Default)]
pub struct ReplaySource {
    forwarded: Arc<AtomicU64>,
}

impl ReplaySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes that reached the player through all buffers.
    pub fn forwarded(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.forwarded)
    }
}

impl MediaSource for ReplaySource {
    fn add_source_buffer(&self, mime_type: &str) -> Result<Box<dyn SourceBuffer>, HostError> {
        if mime_type.trim().is_empty() {
            return Err(HostError::new("NotSupportedError: empty mime type"));
        }
        Ok(Box::new(DiscardingBuffer {
            forwarded: Arc::clone(&self.forwarded),
        }))
    }
}

struct DiscardingBuffer {
    forwarded: Arc<AtomicU64>,
}

impl SourceBuffer for DiscardingBuffer {
    fn append_buffer(&mut self, data: Bytes) -> Result<(), HostError> {
        self.forwarded
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_forwarded_bytes() {
        let source = ReplaySource::new();
        let forwarded = source.forwarded();
        let mut buffer = source.add_source_buffer("video/mp4").unwrap();
        buffer.append_buffer(Bytes::from_static(b"abcd")).unwrap();
        buffer.append_buffer(Bytes::from_static(b"ef")).unwrap();
        assert_eq!(forwarded.load(Ordering::Relaxed), 6);
        assert!(source.add_source_buffer(" ").is_err());
    }
}
