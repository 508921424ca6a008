//! Per-track capture state.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::Serialize;

use crate::sink::SinkHandle;

/// Where newly appended chunks of a stream go.
pub enum SinkState {
    /// No sink; chunks are queued in memory.
    Buffering,
    /// A sink is being opened and the queue drained into it. Chunks are still
    /// queued, behind the ones being drained.
    Migrating,
    /// Chunks are written straight to the sink at the write cursor.
    Attached(SinkHandle),
    /// The sink was closed; further chunks are dropped.
    Closed,
}

impl SinkState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Buffering => "buffering",
            Self::Migrating => "migrating",
            Self::Attached(_) => "attached",
            Self::Closed => "closed",
        }
    }
}

/// What [`CapturedStream::append`] did with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendRoute {
    Queued,
    Written { offset: u64 },
    Dropped,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingChunk {
    pub(crate) seq: u64,
    pub(crate) data: Bytes,
}

/// One intercepted media track.
pub struct CapturedStream {
    id: String,
    mime_type: String,
    ordinal: u64,
    title: String,
    title_final: bool,
    pending: VecDeque<PendingChunk>,
    next_seq: u64,
    sink: SinkState,
    write_cursor: u64,
    removed: bool,
}

impl CapturedStream {
    pub fn new(
        id: impl Into<String>,
        mime_type: impl Into<String>,
        ordinal: u64,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            mime_type: mime_type.into(),
            ordinal,
            title: title.into(),
            title_final: false,
            pending: VecDeque::new(),
            next_seq: 0,
            sink: SinkState::Buffering,
            write_cursor: 0,
            removed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Creation order within the registry.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn is_title_final(&self) -> bool {
        self.title_final
    }

    /// Update the title. Ignored once the title is final.
    pub fn set_title(&mut self, title: String, is_final: bool) {
        if self.title_final {
            return;
        }
        self.title = title;
        self.title_final = is_final;
    }

    pub fn sink_state(&self) -> &SinkState {
        &self.sink
    }

    /// Bytes handed to the sink so far. Zero until a sink is attached.
    pub fn write_cursor(&self) -> u64 {
        self.write_cursor
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub(crate) fn mark_removed(&mut self) {
        self.removed = true;
    }

    /// Route a chunk to exactly one destination.
    pub fn append(&mut self, data: Bytes) -> AppendRoute {
        match &self.sink {
            SinkState::Buffering | SinkState::Migrating => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.pending.push_back(PendingChunk { seq, data });
                AppendRoute::Queued
            }
            SinkState::Attached(handle) => {
                let offset = self.write_cursor;
                let len = data.len() as u64;
                if handle.write(offset, data) {
                    self.write_cursor += len;
                    AppendRoute::Written { offset }
                } else {
                    AppendRoute::Dropped
                }
            }
            SinkState::Closed => AppendRoute::Dropped,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending.iter().map(|c| c.data.len() as u64).sum()
    }

    /// Copy of the queued chunks, oldest first.
    pub fn pending_chunks(&self) -> Vec<Bytes> {
        self.pending.iter().map(|c| c.data.clone()).collect()
    }

    /// Sequence number of the newest queued chunk.
    pub(crate) fn last_pending_seq(&self) -> Option<u64> {
        self.pending.back().map(|c| c.seq)
    }

    /// Drop queued chunks up to and including `seq`. Chunks queued later stay.
    pub(crate) fn discard_pending_through(&mut self, seq: u64) {
        while self.pending.front().is_some_and(|c| c.seq <= seq) {
            self.pending.pop_front();
        }
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Oldest queued chunk newer than `seq`, or the oldest one at all.
    pub(crate) fn pending_after(&self, seq: Option<u64>) -> Option<PendingChunk> {
        self.pending
            .iter()
            .find(|c| seq.is_none_or(|seq| c.seq > seq))
            .cloned()
    }

    /// Data can be retrieved either from memory or from disk.
    pub fn has_retrievable_data(&self) -> bool {
        !self.pending.is_empty() || matches!(self.sink, SinkState::Attached(_) | SinkState::Closed)
    }

    pub fn is_on_disk(&self) -> bool {
        matches!(self.sink, SinkState::Attached(_) | SinkState::Closed)
    }

    /// Try to start a migration. Only a buffering stream can migrate.
    pub(crate) fn begin_migration(&mut self) -> bool {
        if matches!(self.sink, SinkState::Buffering) {
            self.sink = SinkState::Migrating;
            true
        } else {
            false
        }
    }

    /// Give up a migration and return to buffering.
    pub(crate) fn abort_migration(&mut self) {
        if matches!(self.sink, SinkState::Migrating) {
            self.sink = SinkState::Buffering;
        }
    }

    /// Make `handle` the destination of new chunks. Must only be called with
    /// an empty queue, so nothing queued can be overtaken.
    pub(crate) fn install_sink(&mut self, handle: SinkHandle, cursor: u64) {
        debug_assert!(self.pending.is_empty());
        self.sink = SinkState::Attached(handle);
        self.write_cursor = cursor;
    }

    /// Detach the sink, leaving the stream in the closed state.
    pub(crate) fn take_sink(&mut self) -> Option<SinkHandle> {
        match std::mem::replace(&mut self.sink, SinkState::Closed) {
            SinkState::Attached(handle) => Some(handle),
            previous => {
                self.sink = previous;
                None
            }
        }
    }

    pub fn entry(&self, everything: bool) -> DownloadEntry {
        DownloadEntry {
            id: self.id.clone(),
            title: self.title.clone(),
            mime_type: self.mime_type.clone(),
            writable: self.is_on_disk(),
            data: everything.then(|| self.pending.iter().map(|c| c.data.to_vec()).collect()),
            streamed: everything.then_some(self.write_cursor),
        }
    }
}

/// One row of a `getDownloads` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadEntry {
    pub id: String,
    pub title: String,
    pub mime_type: String,
    /// `true` when the data lives on disk rather than in memory.
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Vec<u8>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streamed: Option<u64>,
}
