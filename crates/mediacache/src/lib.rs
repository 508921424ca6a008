//! # MediaCache Engine
//!
//! This crate captures media segments as a host player appends them to its
//! source buffers, keeps them in memory, and migrates them to ordered files in
//! a user-granted directory without losing, duplicating or reordering bytes.
//!
//! ## Features
//!
//! - Transparent `MediaSource` / `SourceBuffer` decorators installed through a slot
//! - Per-stream buffering with a one-time, order-preserving migration to disk
//! - Filename resolution from page metadata with bounded retries
//! - A broadcast control bus with a bridge and a command dispatcher
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod bridge;
pub mod channel;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod download;
pub mod error;
pub mod grant;
pub mod host;
mod interception;
pub mod preferences;
pub mod registry;
pub mod sink;
pub mod stream;
pub mod title;

/// Re-export key traits and types
pub use bridge::{Bridge, probe_engine};
pub use channel::{ChannelEndpoint, ControlBus, ControlMessage, ControlRequest, Origin, actions};
pub use config::{CaptureConfig, CaptureConfigBuilder, DEFAULT_PICKER_ID};
pub use directory::{
    DirectoryHandle, DirectoryPicker, FileHandle, FixedPicker, LocalDirectory, LocalPicker,
    MemoryDirectory, WritableFile,
};
pub use dispatcher::{Command, CommandDispatcher};
pub use download::{DirectoryDownloads, DownloadTarget};
pub use error::{CaptureError, HostError, Result};
pub use grant::DirectoryGrant;
pub use host::{MediaSource, MediaSourceSlot, PageContext, ReadyState, SourceBuffer, StaticPage};
pub use interception::{CapturingMediaSource, CapturingSourceBuffer};
pub use preferences::Preferences;
pub use registry::CaptureRegistry;
pub use sink::{PersistenceSink, SinkHandle};
pub use stream::{AppendRoute, CapturedStream, DownloadEntry, SinkState};
pub use title::{TitleResolver, compose_title, sanitize_title};
