//! One capture run: replay tracks through the engine and report what was kept.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use mediacache_engine::{
    Bridge, CaptureConfig, CaptureRegistry, CommandDispatcher, ControlBus, ControlRequest,
    DirectoryDownloads, LocalDirectory, LocalPicker, MediaSourceSlot, Preferences, ReadyState,
    StaticPage,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cli::TrackInput;
use crate::error::{AppError, Result};
use crate::host::ReplaySource;

/// How long answers are still relayed after the controller closed its input.
const CONTROL_DRAIN: Duration = Duration::from_millis(250);

/// Polling step while waiting for migrations to finish.
const SETTLE_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub tracks: Vec<TrackInput>,
    pub output_dir: Option<PathBuf>,
    pub downloads_dir: PathBuf,
    pub page_url: Option<Url>,
    pub page_title: String,
    pub chunk_size: usize,
    pub chunk_interval: Duration,
    pub capture: CaptureConfig,
    pub preferences: Preferences,
}

impl CaptureOptions {
    /// Upper bound for a stream created now to reach the disk.
    fn settle_timeout(&self) -> Duration {
        let c = &self.capture;
        c.migration_delay
            + c.title_retry_delay * (c.title_max_retries + 1)
            + c.title_poll_interval * 2
            + Duration::from_secs(5)
    }
}

/// Where one stream's bytes ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub id: String,
    pub title: String,
    pub mime_type: String,
    pub on_disk: bool,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub streams: Vec<StreamReport>,
    /// Bytes the simulated player received.
    pub forwarded: u64,
}

/// Engine, host and control plumbing for one run.
pub struct CaptureSession {
    registry: Arc<CaptureRegistry>,
    slot: Arc<MediaSourceSlot>,
    dispatcher: Arc<CommandDispatcher>,
    bus: ControlBus,
    cancel: CancellationToken,
    forwarded: Arc<AtomicU64>,
}

impl CaptureSession {
    pub async fn start(options: &CaptureOptions) -> Result<Self> {
        let page = StaticPage::new(options.page_url.clone(), options.page_title.clone());
        page.set_ready_state(ReadyState::Complete);

        let downloads = LocalDirectory::create(options.downloads_dir.clone()).await?;
        let registry = CaptureRegistry::new(
            options.capture.clone(),
            Arc::new(page),
            Arc::new(DirectoryDownloads::new(Arc::new(downloads))),
        )?;
        registry.set_preferences(options.preferences);

        let source = ReplaySource::new();
        let forwarded = source.forwarded();
        let slot = Arc::new(MediaSourceSlot::new(Arc::new(source)));
        registry.start(&slot);

        let picker = Arc::new(LocalPicker::new(options.output_dir.clone()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            picker,
            Arc::clone(&slot),
        ));
        let bus = ControlBus::from_config(&options.capture);
        let cancel = CancellationToken::new();
        Arc::clone(&dispatcher).spawn(&bus, cancel.clone());

        Ok(Self {
            registry,
            slot,
            dispatcher,
            bus,
            cancel,
            forwarded,
        })
    }

    pub fn registry(&self) -> &Arc<CaptureRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &ControlBus {
        &self.bus
    }

    /// Grant the configured output directory, as a user answering the picker would.
    pub async fn grant_output(&self) -> Result<usize> {
        let attached = self.dispatcher.grant(None).await?;
        info!(attached, "Output directory granted");
        Ok(attached)
    }

    /// Replay every track concurrently. Returns the bytes read per track.
    pub async fn replay(
        &self,
        tracks: &[TrackInput],
        chunk_size: usize,
        interval: Duration,
    ) -> Result<Vec<u64>> {
        let replays = tracks
            .iter()
            .map(|track| replay_track(&self.slot, track, chunk_size, interval));
        join_all(replays).await.into_iter().collect()
    }

    /// Wait until every stream is on disk. `false` when `timeout` expired first.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pending = self
                .registry
                .stream_ids()
                .iter()
                .filter(|id| self.registry.inspect(id, |s| s.is_on_disk()) == Some(false))
                .count();
            if pending == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pending, "Streams still in memory after waiting for migration");
                return false;
            }
            tokio::time::sleep(SETTLE_STEP).await;
        }
    }

    pub fn report(&self) -> CaptureReport {
        let streams = self
            .registry
            .stream_ids()
            .iter()
            .filter_map(|id| {
                self.registry.inspect(id, |s| StreamReport {
                    id: s.id().to_owned(),
                    title: s.title().to_owned(),
                    mime_type: s.mime_type().to_owned(),
                    on_disk: s.is_on_disk(),
                    bytes: s.write_cursor() + s.pending_bytes(),
                })
            })
            .collect();
        CaptureReport {
            streams,
            forwarded: self.forwarded.load(Ordering::Relaxed),
        }
    }

    /// Playback is over: report, then flush every stream per the preferences.
    pub async fn finish(self) -> CaptureReport {
        let report = self.report();
        self.registry.flush_all().await;
        self.cancel.cancel();
        report
    }
}

async fn replay_track(
    slot: &MediaSourceSlot,
    track: &TrackInput,
    chunk_size: usize,
    interval: Duration,
) -> Result<u64> {
    let mut buffer =
        slot.add_source_buffer(&track.mime_type)
            .map_err(|e| AppError::TrackRefused {
                mime_type: track.mime_type.clone(),
                reason: e.to_string(),
            })?;
    let mut file = tokio::fs::File::open(&track.path).await?;
    let mut chunk = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if let Err(e) = buffer.append_buffer(Bytes::copy_from_slice(&chunk[..n])) {
            warn!(file = %track.path.display(), error = %e, "Player rejected chunk");
        }
        total += n as u64;
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    debug!(file = %track.path.display(), mime_type = %track.mime_type, bytes = total, "Track replayed");
    Ok(total)
}

/// Relay JSON-line control requests from `reader` onto the bus and write
/// every answer to `writer`, until `reader` is exhausted.
pub async fn serve_control<R, W>(bus: &ControlBus, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (bridge, mut from_page) = Bridge::spawn(bus);
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ControlRequest>(&line) {
                    Ok(request) => {
                        if let Some(answer) = bridge.handle(request) {
                            write_message(&mut writer, &answer).await?;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed control line"),
                }
            }
            Some(answer) = from_page.recv() => write_message(&mut writer, &answer).await?,
        }
    }

    while let Ok(Some(answer)) = tokio::time::timeout(CONTROL_DRAIN, from_page.recv()).await {
        write_message(&mut writer, &answer).await?;
    }
    bridge.shutdown().await;
    debug!("Control input closed");
    Ok(())
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &ControlRequest) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// A full run: replay, optionally serve the control protocol, settle and flush.
pub async fn run(options: CaptureOptions, control: bool) -> Result<CaptureReport> {
    let session = CaptureSession::start(&options).await?;
    // A controller grants through `fileSystem` itself.
    if options.output_dir.is_some() && !control {
        session.grant_output().await?;
    }

    let replay = session.replay(&options.tracks, options.chunk_size, options.chunk_interval);
    if control {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let serve = serve_control(session.bus(), stdin, tokio::io::stdout());
        let (replayed, served) = tokio::join!(replay, serve);
        replayed?;
        served?;
    } else {
        replay.await?;
    }

    if session.registry().directory_grant().is_some() {
        session.settle(options.settle_timeout()).await;
    }

    let report = session.finish().await;
    for stream in &report.streams {
        info!(
            stream_id = %stream.id,
            title = %stream.title,
            mime_type = %stream.mime_type,
            bytes = stream.bytes,
            on_disk = stream.on_disk,
            "Captured stream"
        );
    }
    info!(streams = report.streams.len(), forwarded = report.forwarded, "Capture finished");
    Ok(report)
}
