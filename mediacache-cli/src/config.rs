use std::path::{Path, PathBuf};
use std::time::Duration;

use mediacache_engine::{CaptureConfig, DEFAULT_PICKER_ID, Preferences};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "mediacache=info,mediacache_engine=info";

/// Default size of one appended chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Engine timings, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub title_retry_delay_ms: u64,
    pub title_max_retries: u32,
    pub migration_delay_ms: u64,
    pub title_poll_interval_ms: u64,
    pub picker_id: String,
    pub bus_capacity: usize,
}

impl Default for CaptureSection {
    fn default() -> Self {
        let defaults = CaptureConfig::default();
        Self {
            title_retry_delay_ms: defaults.title_retry_delay.as_millis() as u64,
            title_max_retries: defaults.title_max_retries,
            migration_delay_ms: defaults.migration_delay.as_millis() as u64,
            title_poll_interval_ms: defaults.title_poll_interval.as_millis() as u64,
            picker_id: DEFAULT_PICKER_ID.to_owned(),
            bus_capacity: defaults.bus_capacity,
        }
    }
}

/// Configuration for the entire program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory granted to the engine for streaming tracks to disk
    pub output_dir: Option<PathBuf>,

    /// Directory receiving downloads of in-memory tracks
    pub downloads_dir: PathBuf,

    /// Directory for rotated log files
    pub log_dir: Option<PathBuf>,

    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_filter: String,

    /// Bytes per appended chunk
    pub chunk_size: usize,

    /// Pause between two appends of a track
    pub chunk_interval_ms: u64,

    pub capture: CaptureSection,

    pub preferences: Preferences,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            downloads_dir: PathBuf::from("downloads"),
            log_dir: None,
            log_filter: DEFAULT_LOG_FILTER.to_owned(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_interval_ms: 0,
            capture: CaptureSection::default(),
            preferences: Preferences::default(),
        }
    }
}

impl AppConfig {
    /// Load `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::parse(&std::fs::read_to_string(path)?),
            None => Ok(Self::default()),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(AppError::InvalidInput("chunk_size must be positive".into()));
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        let c = &self.capture;
        CaptureConfig::builder()
            .title_retry_delay(Duration::from_millis(c.title_retry_delay_ms))
            .title_max_retries(c.title_max_retries)
            .migration_delay(Duration::from_millis(c.migration_delay_ms))
            .title_poll_interval(Duration::from_millis(c.title_poll_interval_ms))
            .picker_id(c.picker_id.clone())
            .bus_capacity(c.bus_capacity)
            .build()
    }

    pub fn show(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AppError::InvalidInput(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.capture_config().migration_delay, Duration::from_millis(1600));
    }

    #[test]
    fn test_parse_partial_file() {
        let config = AppConfig::parse(
            r#"
            output_dir = "/srv/captures"
            chunk_size = 4096

            [capture]
            migration_delay_ms = 10

            [preferences]
            delete_entries_when_video_finishes = true
            "#,
        )
        .unwrap();

        assert_eq!(config.output_dir, Some(PathBuf::from("/srv/captures")));
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.capture.migration_delay_ms, 10);
        assert_eq!(config.capture.title_max_retries, 4);
        assert!(config.preferences.delete_entries_when_video_finishes);
        assert!(config.preferences.download_content_when_video_finishes);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        assert!(matches!(
            AppConfig::parse("chunk_size = 0"),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mediacache.toml");
        std::fs::write(&path, "downloads_dir = \"saved\"\n").unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.downloads_dir, PathBuf::from("saved"));
    }

    #[test]
    fn test_show_round_trips() {
        let shown = AppConfig::default().show().unwrap();
        assert_eq!(AppConfig::parse(&shown).unwrap(), AppConfig::default());
    }
}
