//! The set of captured streams and every operation on them.
//!
//! The registry owns all in-memory capture state. Hosts reach it through the
//! interception decorators (`create_stream` / `append`), controllers through
//! the [`crate::CommandDispatcher`].
//!
//! # Migration ordering
//!
//! A stream moves from memory to disk exactly once. The drain writes queued
//! chunks front to back in sequence order without removing them. While it
//! runs the stream stays in [`SinkState::Migrating`], so concurrent appends
//! keep queueing behind the drained chunks. The sink becomes visible to the
//! append path only under the stream lock, at the moment no unwritten chunk
//! is left; the drained chunks are released in that same step. A failed
//! drain leaves the whole queue in memory, so a later attach rewrites the
//! file from the first byte. No chunk can be written twice, skipped or
//! overtaken.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::CaptureConfig;
use crate::directory::DirectoryHandle;
use crate::download::DownloadTarget;
use crate::error::{CaptureError, Result};
use crate::grant::DirectoryGrant;
use crate::host::{MediaSourceSlot, PageContext};
use crate::interception::CapturingMediaSource;
use crate::preferences::Preferences;
use crate::sink::{PersistenceSink, SinkHandle};
use crate::stream::{AppendRoute, CapturedStream, DownloadEntry, SinkState};
use crate::title::TitleResolver;

type SharedStream = Arc<Mutex<CapturedStream>>;

enum DrainStep {
    Write { seq: u64, data: Bytes },
    Abandon,
}

pub struct CaptureRegistry {
    config: CaptureConfig,
    runtime: Handle,
    streams: DashMap<String, SharedStream>,
    next_ordinal: AtomicU64,
    installed: AtomicBool,
    grant: RwLock<Option<Arc<DirectoryGrant>>>,
    titles: TitleResolver,
    downloads: Arc<dyn DownloadTarget>,
    preferences: RwLock<Preferences>,
}

impl CaptureRegistry {
    /// Create a registry bound to the current tokio runtime.
    pub fn new(
        config: CaptureConfig,
        page: Arc<dyn PageContext>,
        downloads: Arc<dyn DownloadTarget>,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|e| CaptureError::Runtime(e.to_string()))?;
        let titles = TitleResolver::new(page, &config);
        Ok(Arc::new(Self {
            config,
            runtime,
            streams: DashMap::new(),
            next_ordinal: AtomicU64::new(0),
            installed: AtomicBool::new(false),
            grant: RwLock::new(None),
            titles,
            downloads,
            preferences: RwLock::new(Preferences::default()),
        }))
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    // ========== Interception lifecycle ==========

    /// Install interception on `slot`. Returns `false` when this registry
    /// already intercepts, in which case nothing changes.
    pub fn start(self: &Arc<Self>, slot: &MediaSourceSlot) -> bool {
        if self.installed.swap(true, Ordering::SeqCst) {
            debug!("Interception already installed");
            return false;
        }
        let registry = Arc::clone(self);
        slot.wrap(move |inner| Arc::new(CapturingMediaSource::new(inner, registry)));
        info!("Interception installed");
        true
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Drop every stream and its queued chunks. Attached sinks are closed
    /// after their queued writes. Interception stays installed.
    pub fn stop(&self) -> usize {
        let ids: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        let count = ids.iter().filter(|id| self.remove_stream(id)).count();
        info!(streams = count, "Dropped all captured streams");
        count
    }

    // ========== Host-facing operations ==========

    /// Register a new stream for a source buffer of `mime_type`.
    pub fn create_stream(self: &Arc<Self>, mime_type: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::SeqCst);
        let initial = self.titles.sample(&id, mime_type);

        let stream = Arc::new(Mutex::new(CapturedStream::new(
            id.clone(),
            mime_type,
            ordinal,
            initial.title,
        )));
        self.streams.insert(id.clone(), Arc::clone(&stream));
        info!(stream_id = %id, mime_type = %mime_type, "Capturing new source buffer");

        let resolver = self.titles.clone();
        let weak = Arc::downgrade(&stream);
        let (title_id, title_mime) = (id.clone(), mime_type.to_owned());
        self.runtime.spawn(async move {
            resolver
                .resolve(&title_id, &title_mime, |title, is_final| {
                    let Some(stream) = weak.upgrade() else {
                        return false;
                    };
                    let mut stream = stream.lock();
                    if stream.is_removed() {
                        return false;
                    }
                    stream.set_title(title, is_final);
                    true
                })
                .await;
        });

        if self.directory_grant().is_some() {
            let registry = Arc::clone(self);
            let stream_id = id.clone();
            self.runtime.spawn(async move {
                tokio::time::sleep(registry.config.migration_delay).await;
                registry.log_attach_result(&stream_id, registry.attach(&stream_id).await);
            });
        }

        id
    }

    /// Route an appended chunk. `None` when the stream is unknown (deleted).
    pub fn append(&self, id: &str, data: Bytes) -> Option<AppendRoute> {
        let stream = self.stream(id)?;
        let len = data.len();
        let route = stream.lock().append(data);
        trace!(stream_id = %id, bytes = len, ?route, "Chunk appended");
        if route == AppendRoute::Dropped {
            debug!(stream_id = %id, bytes = len, "Chunk dropped, sink is closed");
        }
        Some(route)
    }

    // ========== Controller-facing operations ==========

    /// Delete a stream. Permanent deletion forgets it (closing its sink);
    /// otherwise only the queued data is cleared. Returns whether the id was known.
    pub fn delete_stream(&self, id: &str, permanent: bool) -> bool {
        if permanent {
            return self.remove_stream(id);
        }
        match self.stream(id) {
            Some(stream) => {
                stream.lock().clear_pending();
                debug!(stream_id = %id, "Cleared queued data");
                true
            }
            None => false,
        }
    }

    /// Close the stream's sink and forget the stream.
    ///
    /// A sink closed earlier (by a flush) only needs the stream forgotten.
    /// A stream that never reached the disk is left untouched and `None` is returned.
    pub async fn finalize(&self, id: &str) -> Result<Option<u64>> {
        let stream = self
            .stream(id)
            .ok_or_else(|| CaptureError::stream_not_found(id))?;

        let handle = {
            let mut stream = stream.lock();
            if matches!(stream.sink_state(), SinkState::Closed) {
                stream.mark_removed();
                let bytes = stream.write_cursor();
                drop(stream);
                self.streams.remove(id);
                info!(stream_id = %id, bytes, "Closed stream finalized");
                return Ok(Some(bytes));
            }
            match stream.take_sink() {
                Some(handle) => {
                    stream.mark_removed();
                    handle
                }
                None => {
                    debug!(stream_id = %id, state = stream.sink_state().label(), "Nothing to finalize");
                    return Ok(None);
                }
            }
        };
        self.streams.remove(id);

        let bytes = handle.close().await?;
        info!(stream_id = %id, bytes, "Stream finalized");
        Ok(Some(bytes))
    }

    /// Streams with retrievable data, in creation order.
    pub fn downloads(&self, everything: bool) -> Vec<DownloadEntry> {
        let mut rows: Vec<(u64, DownloadEntry)> = self
            .all_streams()
            .into_iter()
            .filter_map(|stream| {
                let stream = stream.lock();
                stream
                    .has_retrievable_data()
                    .then(|| (stream.ordinal(), stream.entry(everything)))
            })
            .collect();
        rows.sort_by_key(|(ordinal, _)| *ordinal);
        rows.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Save the queued chunks of a buffering stream through the download
    /// target, then drop them from memory. Returns `false` when there was
    /// nothing to save or the stream is (being) persisted to disk.
    pub async fn download(&self, id: &str) -> Result<bool> {
        let Some(stream) = self.stream(id) else {
            return Ok(false);
        };

        let (title, chunks, last_seq) = {
            let stream = stream.lock();
            match (stream.sink_state(), stream.last_pending_seq()) {
                (SinkState::Buffering, Some(last_seq)) => {
                    (stream.title().to_owned(), stream.pending_chunks(), last_seq)
                }
                _ => return Ok(false),
            }
        };

        self.downloads.save(&title, &chunks).await?;
        stream.lock().discard_pending_through(last_seq);
        Ok(true)
    }

    pub fn preferences(&self) -> Preferences {
        *self.preferences.read()
    }

    pub fn set_preferences(&self, preferences: Preferences) {
        *self.preferences.write() = preferences;
    }

    pub fn update_preferences(&self, update: &Map<String, Value>) -> Preferences {
        let mut prefs = self.preferences.write();
        prefs.apply_update(update);
        *prefs
    }

    /// Playback finished or the page is going away: download, finalize and
    /// forget streams as the preferences say.
    pub async fn flush_all(&self) {
        let prefs = self.preferences();
        let ids = self.stream_ids();
        debug!(streams = ids.len(), ?prefs, "Flushing all streams");

        for id in &ids {
            if prefs.download_content_when_video_finishes {
                if let Err(e) = self.download(id).await {
                    warn!(stream_id = %id, error = %e, "Download on flush failed");
                }
            }
            if prefs.finalize_fs_stream_when_video_finishes {
                self.close_sink(id).await;
            }
        }

        if prefs.delete_entries_when_video_finishes {
            for id in &ids {
                self.remove_stream(id);
            }
        }
    }

    // ========== Persistence ==========

    pub fn directory_grant(&self) -> Option<Arc<DirectoryGrant>> {
        self.grant.read().clone()
    }

    /// Make `directory` the active grant and migrate every tracked stream
    /// to it. Returns how many streams were attached.
    pub async fn grant_directory(&self, directory: Arc<dyn DirectoryHandle>) -> usize {
        let grant = Arc::new(DirectoryGrant::new(directory));
        info!(directory = %grant.location(), "Directory granted");
        *self.grant.write() = Some(grant);

        let ids = self.stream_ids();
        let results = join_all(ids.iter().map(|id| self.attach(id))).await;

        let mut attached = 0;
        for (id, result) in ids.iter().zip(results) {
            if result.is_ok() {
                attached += 1;
            }
            self.log_attach_result(id, result);
        }
        attached
    }

    /// Migrate a stream to a file of the active grant named after its final title.
    ///
    /// Waits for the title to become final first. On failure the stream stays
    /// in memory with nothing attached. Returns the bytes drained.
    pub async fn attach(&self, id: &str) -> Result<u64> {
        let stream = self
            .stream(id)
            .ok_or_else(|| CaptureError::stream_not_found(id))?;

        let title = loop {
            {
                let mut guard = stream.lock();
                if guard.is_removed() {
                    return Err(CaptureError::stream_not_found(id));
                }
                if !matches!(guard.sink_state(), SinkState::Buffering) {
                    return Err(CaptureError::AlreadyAttached { id: id.to_owned() });
                }
                if guard.is_title_final() {
                    guard.begin_migration();
                    break guard.title().to_owned();
                }
            }
            tokio::time::sleep(self.config.title_poll_interval).await;
        };

        let Some(grant) = self.directory_grant() else {
            stream.lock().abort_migration();
            return Err(CaptureError::NoDirectoryGrant);
        };
        let sink = match grant.open_sink(&title, false).await {
            Ok(sink) => sink,
            Err(e) => {
                stream.lock().abort_migration();
                return Err(e);
            }
        };
        self.migrate(id, &stream, sink).await
    }

    /// Migrate a stream to an explicitly named file, without waiting for its title.
    pub async fn attach_to_file(
        &self,
        id: &str,
        directory: Arc<dyn DirectoryHandle>,
        name: &str,
    ) -> Result<u64> {
        let stream = self
            .stream(id)
            .ok_or_else(|| CaptureError::stream_not_found(id))?;
        if !stream.lock().begin_migration() {
            return Err(CaptureError::AlreadyAttached { id: id.to_owned() });
        }

        let grant = DirectoryGrant::new(directory);
        let sink = match grant.open_sink(name, false).await {
            Ok(sink) => sink,
            Err(e) => {
                stream.lock().abort_migration();
                return Err(e);
            }
        };
        self.migrate(id, &stream, sink).await
    }

    async fn migrate(
        &self,
        id: &str,
        stream: &SharedStream,
        mut sink: PersistenceSink,
    ) -> Result<u64> {
        debug!(stream_id = %id, file = %sink.name(), "Migration started");
        let mut written: Option<u64> = None;
        loop {
            let step = {
                let mut guard = stream.lock();
                if guard.is_removed() {
                    DrainStep::Abandon
                } else if let Some(chunk) = guard.pending_after(written) {
                    DrainStep::Write {
                        seq: chunk.seq,
                        data: chunk.data,
                    }
                } else {
                    // Everything queued is on disk: from here on appends go
                    // straight to the sink, after everything drained.
                    let cursor = sink.cursor();
                    let file = sink.name().to_owned();
                    guard.clear_pending();
                    guard.install_sink(SinkHandle::spawn(&self.runtime, sink), cursor);
                    info!(stream_id = %id, file = %file, bytes = cursor, "Stream attached to disk");
                    return Ok(cursor);
                }
            };

            match step {
                DrainStep::Abandon => {
                    if let Err(e) = sink.close().await {
                        debug!(stream_id = %id, error = %e, "Failed to close abandoned sink");
                    }
                    return Err(CaptureError::stream_not_found(id));
                }
                DrainStep::Write { seq, data } => {
                    if let Err(e) = sink.append(&data).await {
                        stream.lock().abort_migration();
                        let _ = sink.close().await;
                        return Err(e);
                    }
                    written = Some(seq);
                }
            }
        }
    }

    // ========== Queries ==========

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    /// Stream ids in creation order.
    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<(u64, String)> = self
            .all_streams()
            .into_iter()
            .map(|stream| {
                let stream = stream.lock();
                (stream.ordinal(), stream.id().to_owned())
            })
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Run `f` against a stream's current state.
    pub fn inspect<R>(&self, id: &str, f: impl FnOnce(&CapturedStream) -> R) -> Option<R> {
        self.stream(id).map(|stream| f(&stream.lock()))
    }

    /// Chunks currently held in memory for a stream, oldest first.
    pub fn buffered_chunks(&self, id: &str) -> Option<Vec<Bytes>> {
        self.inspect(id, CapturedStream::pending_chunks)
    }

    // ========== Internals ==========

    fn stream(&self, id: &str) -> Option<SharedStream> {
        self.streams.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn all_streams(&self) -> Vec<SharedStream> {
        self.streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn remove_stream(&self, id: &str) -> bool {
        let Some((_, stream)) = self.streams.remove(id) else {
            return false;
        };
        let mut stream = stream.lock();
        stream.mark_removed();
        if let Some(handle) = stream.take_sink() {
            handle.shutdown();
        }
        debug!(stream_id = %id, "Stream removed");
        true
    }

    async fn close_sink(&self, id: &str) {
        let Some(handle) = self.stream(id).and_then(|stream| stream.lock().take_sink()) else {
            return;
        };
        match handle.close().await {
            Ok(bytes) => info!(stream_id = %id, bytes, "Sink closed"),
            Err(e) => warn!(stream_id = %id, error = %e, "Failed to close sink"),
        }
    }

    fn log_attach_result(&self, id: &str, result: Result<u64>) {
        match result {
            Ok(_) => {}
            Err(e @ (CaptureError::StreamNotFound { .. } | CaptureError::AlreadyAttached { .. })) => {
                debug!(stream_id = %id, reason = %e, "Migration skipped")
            }
            Err(e) => warn!(stream_id = %id, error = %e, "Migration failed, stream stays in memory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::download::DirectoryDownloads;
    use crate::host::StaticPage;
    use serde_json::json;

    fn registry() -> (Arc<CaptureRegistry>, MemoryDirectory) {
        let downloads = MemoryDirectory::new("downloads");
        let registry = CaptureRegistry::new(
            CaptureConfig::builder().immediate().build(),
            Arc::new(StaticPage::loaded(None, "Clip")),
            Arc::new(DirectoryDownloads::new(Arc::new(downloads.clone()))),
        )
        .unwrap();
        (registry, downloads)
    }

    fn concat(chunks: &[Bytes]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = CaptureRegistry::new(
            CaptureConfig::default(),
            Arc::new(StaticPage::loaded(None, "x")),
            Arc::new(DirectoryDownloads::new(Arc::new(MemoryDirectory::new("d")))),
        );
        assert!(matches!(result, Err(CaptureError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_buffered_data_is_exact_concatenation() {
        let (registry, _) = registry();
        let id = registry.create_stream("video/mp4");
        let chunks: Vec<Bytes> = (0u8..20).map(|i| Bytes::from(vec![i; i as usize])).collect();
        for chunk in &chunks {
            assert_eq!(registry.append(&id, chunk.clone()), Some(AppendRoute::Queued));
        }
        let buffered = registry.buffered_chunks(&id).unwrap();
        assert_eq!(concat(&buffered), concat(&chunks));
    }

    #[tokio::test]
    async fn test_append_to_unknown_stream() {
        let (registry, _) = registry();
        assert_eq!(registry.append("nope", Bytes::from_static(b"x")), None);
    }

    #[tokio::test]
    async fn test_delete_non_permanent_keeps_stream() {
        let (registry, _) = registry();
        let id = registry.create_stream("video/mp4");
        registry.append(&id, Bytes::from_static(b"abc"));

        assert!(registry.delete_stream(&id, false));
        assert!(registry.contains(&id));
        assert!(registry.downloads(false).is_empty());

        registry.append(&id, Bytes::from_static(b"d"));
        assert_eq!(concat(&registry.buffered_chunks(&id).unwrap()), b"d");
    }

    #[tokio::test]
    async fn test_delete_permanent_forgets_stream() {
        let (registry, _) = registry();
        let id = registry.create_stream("video/mp4");
        registry.append(&id, Bytes::from_static(b"abc"));

        assert!(registry.delete_stream(&id, true));
        assert!(!registry.contains(&id));
        assert!(!registry.delete_stream(&id, true));
        assert!(!registry.delete_stream(&id, false));
        assert_eq!(registry.append(&id, Bytes::from_static(b"x")), None);
        assert!(matches!(
            registry.finalize(&id).await,
            Err(CaptureError::StreamNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_drops_everything() {
        let (registry, _) = registry();
        let a = registry.create_stream("video/mp4");
        let b = registry.create_stream("audio/mp4");
        registry.append(&a, Bytes::from_static(b"1"));
        registry.append(&b, Bytes::from_static(b"2"));

        assert_eq!(registry.stop(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.stop(), 0);
    }

    #[tokio::test]
    async fn test_stream_ids_in_creation_order() {
        let (registry, _) = registry();
        let ids: Vec<String> = (0..6).map(|_| registry.create_stream("video/mp4")).collect();
        assert_eq!(registry.stream_ids(), ids);
    }

    #[tokio::test]
    async fn test_download_saves_and_clears() {
        let (registry, downloads) = registry();
        let id = registry.create_stream("video/mp4");
        registry.append(&id, Bytes::from_static(b"hello "));
        registry.append(&id, Bytes::from_static(b"world"));
        let title = registry.inspect(&id, |s| s.title().to_owned()).unwrap();

        assert!(registry.download(&id).await.unwrap());
        assert_eq!(downloads.contents(&title).unwrap(), b"hello world");
        assert!(registry.buffered_chunks(&id).unwrap().is_empty());

        // nothing left to save
        assert!(!registry.download(&id).await.unwrap());
        assert!(!registry.download("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_download_keeps_data() {
        let registry = CaptureRegistry::new(
            CaptureConfig::builder().immediate().build(),
            Arc::new(StaticPage::loaded(None, "Clip")),
            Arc::new(DirectoryDownloads::new(Arc::new(MemoryDirectory::read_only(
                "ro",
            )))),
        )
        .unwrap();
        let id = registry.create_stream("video/mp4");
        registry.append(&id, Bytes::from_static(b"keep"));

        assert!(registry.download(&id).await.is_err());
        assert_eq!(concat(&registry.buffered_chunks(&id).unwrap()), b"keep");
    }

    #[tokio::test]
    async fn test_preferences_update() {
        let (registry, _) = registry();
        let update = json!({"delete_entries_when_video_finishes": true});
        let prefs = registry.update_preferences(update.as_object().unwrap());
        assert!(prefs.delete_entries_when_video_finishes);
        assert_eq!(registry.preferences(), prefs);
    }

    #[tokio::test]
    async fn test_flush_all_with_defaults() {
        let (registry, downloads) = registry();
        let id = registry.create_stream("video/mp4");
        registry.append(&id, Bytes::from_static(b"data"));
        let title = registry.inspect(&id, |s| s.title().to_owned()).unwrap();

        registry.flush_all().await;

        assert_eq!(downloads.contents(&title).unwrap(), b"data");
        // delete_entries_when_video_finishes is off by default
        assert!(registry.contains(&id));
    }

    #[tokio::test]
    async fn test_finalize_after_flush_forgets_closed_stream() {
        let (registry, _) = registry();
        let id = registry.create_stream("video/mp4");
        registry.append(&id, Bytes::from_static(b"abc"));
        let files = MemoryDirectory::new("out");
        assert_eq!(registry.grant_directory(Arc::new(files.clone())).await, 1);
        registry.append(&id, Bytes::from_static(b"de"));

        // finalize_fs_stream_when_video_finishes is on by default
        registry.flush_all().await;
        assert_eq!(
            registry.inspect(&id, |s| s.sink_state().label()),
            Some("closed")
        );
        assert_eq!(registry.downloads(false).len(), 1);

        assert_eq!(registry.finalize(&id).await.unwrap(), Some(5));
        assert!(!registry.contains(&id));
        assert!(registry.downloads(false).is_empty());
        let title = files.file_names().pop().unwrap();
        assert_eq!(files.contents(&title).unwrap(), b"abcde");
    }

    #[tokio::test]
    async fn test_flush_all_deletes_when_asked() {
        let (registry, downloads) = registry();
        registry.update_preferences(
            json!({
                "delete_entries_when_video_finishes": true,
                "download_content_when_video_finishes": false,
            })
            .as_object()
            .unwrap(),
        );
        let id = registry.create_stream("video/mp4");
        registry.append(&id, Bytes::from_static(b"data"));

        registry.flush_all().await;

        assert!(registry.is_empty());
        assert!(downloads.file_names().is_empty());
    }
}
