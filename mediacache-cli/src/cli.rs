use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// A media track to replay: a mime type and the file holding its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInput {
    pub mime_type: String,
    pub path: PathBuf,
}

/// Parse `MIME=FILE`, or a bare `FILE` whose mime type is guessed from its extension.
pub fn parse_track(value: &str) -> Result<TrackInput, String> {
    let (mime_type, path) = match value.split_once('=') {
        Some((mime, path)) if mime.contains('/') => (mime.trim().to_owned(), PathBuf::from(path)),
        _ => {
            let path = PathBuf::from(value);
            (guess_mime_type(&path).to_owned(), path)
        }
    };
    if path.as_os_str().is_empty() {
        return Err(format!("missing file in track `{value}`"));
    }
    Ok(TrackInput { mime_type, path })
}

fn guess_mime_type(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp4" | "m4s" | "m4v") => "video/mp4",
        Some("m4a") => "audio/mp4",
        Some("webm") => "video/webm",
        Some("weba") => "audio/webm",
        Some("ts") => "video/mp2t",
        Some("aac") => "audio/aac",
        _ => "application/octet-stream",
    }
}

#[derive(Parser, Debug)]
#[command(name = "mediacache")]
#[command(about = "Capture media source-buffer appends and persist them as ordered files")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "MEDIACACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write daily-rotated log files into this directory
    #[arg(long, global = true, env = "MEDIACACHE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay tracks through an intercepted media source
    Run {
        /// Track to replay, as MIME=FILE (repeatable)
        #[arg(short, long = "track", value_parser = parse_track, required = true)]
        tracks: Vec<TrackInput>,

        /// Directory granted for streaming captured tracks to disk
        #[arg(short, long, env = "MEDIACACHE_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,

        /// Directory receiving downloads of in-memory tracks
        #[arg(short, long, env = "MEDIACACHE_DOWNLOADS_DIR")]
        downloads_dir: Option<PathBuf>,

        /// URL of the simulated page, used for title heuristics
        #[arg(long)]
        page_url: Option<String>,

        /// Document title of the simulated page
        #[arg(long)]
        page_title: Option<String>,

        /// Bytes per appended chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Pause between two appends of a track, in milliseconds
        #[arg(long)]
        chunk_interval_ms: Option<u64>,

        /// Serve the control protocol as JSON lines on stdin/stdout
        #[arg(long)]
        control: bool,
    },

    /// Print the effective configuration
    Config,
}
