//! Transparent decorators around the host's media source primitives.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::HostError;
use crate::host::{MediaSource, SourceBuffer};
use crate::registry::CaptureRegistry;

/// Wraps a [`MediaSource`] so every new source buffer is captured.
pub struct CapturingMediaSource {
    inner: Arc<dyn MediaSource>,
    registry: Arc<CaptureRegistry>,
}

impl CapturingMediaSource {
    pub fn new(inner: Arc<dyn MediaSource>, registry: Arc<CaptureRegistry>) -> Self {
        Self { inner, registry }
    }
}

impl MediaSource for CapturingMediaSource {
    fn add_source_buffer(&self, mime_type: &str) -> Result<Box<dyn SourceBuffer>, HostError> {
        // The host decides first; a refused buffer is never tracked.
        let inner = self.inner.add_source_buffer(mime_type)?;
        let stream_id = self.registry.create_stream(mime_type);
        Ok(Box::new(CapturingSourceBuffer {
            inner,
            stream_id,
            registry: Arc::clone(&self.registry),
        }))
    }
}

/// Mirrors every appended chunk into the registry, then forwards it.
pub struct CapturingSourceBuffer {
    inner: Box<dyn SourceBuffer>,
    stream_id: String,
    registry: Arc<CaptureRegistry>,
}

impl SourceBuffer for CapturingSourceBuffer {
    fn append_buffer(&mut self, data: Bytes) -> Result<(), HostError> {
        self.registry.append(&self.stream_id, data.clone());
        self.inner.append_buffer(data)
    }
}
