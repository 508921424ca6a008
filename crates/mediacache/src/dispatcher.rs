//! Turns control messages into registry operations.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::pong;
use crate::channel::{ChannelEndpoint, ControlBus, ControlRequest, Origin, actions};
use crate::directory::DirectoryPicker;
use crate::error::{CaptureError, Result};
use crate::host::MediaSourceSlot;
use crate::preferences::{Preferences, is_truthy};
use crate::registry::CaptureRegistry;

/// A parsed control request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Start,
    Stop,
    GetDownloads {
        everything: bool,
        context: Option<Value>,
    },
    DownloadThis {
        id: String,
    },
    DeleteThis {
        id: String,
        permanent: bool,
    },
    FsFinalize {
        id: String,
    },
    /// Grant a directory, picked by the user unless a location is given.
    FileSystem {
        location: Option<String>,
    },
    FileSystemSingleOperation {
        id: String,
        location: String,
        name: Option<String>,
    },
    UpdateChoices(Map<String, Value>),
    GetChoices,
}

#[derive(Deserialize)]
struct DeleteContent {
    id: String,
    #[serde(default)]
    permanent: Value,
}

#[derive(Deserialize)]
struct SingleOperationContent {
    id: String,
    location: String,
    #[serde(default)]
    name: Option<String>,
}

impl TryFrom<&ControlRequest> for Command {
    type Error = CaptureError;

    fn try_from(request: &ControlRequest) -> Result<Self> {
        let action = request.action.as_str();
        let stream_id = || {
            request
                .content_str()
                .map(str::to_owned)
                .ok_or_else(|| CaptureError::invalid_request(action, "content must be a stream id"))
        };
        let content = || request.content.clone().unwrap_or(Value::Null);

        let command = match action {
            actions::PING => Self::Ping,
            actions::START => Self::Start,
            actions::STOP => Self::Stop,
            actions::GET_DOWNLOADS => Self::GetDownloads {
                everything: request.everything,
                context: request.content.clone(),
            },
            actions::DOWNLOAD_THIS => Self::DownloadThis { id: stream_id()? },
            actions::DELETE_THIS => {
                let content: DeleteContent = serde_json::from_value(content())
                    .map_err(|e| CaptureError::invalid_request(action, e.to_string()))?;
                Self::DeleteThis {
                    id: content.id,
                    permanent: is_truthy(&content.permanent),
                }
            }
            actions::FS_FINALIZE => Self::FsFinalize { id: stream_id()? },
            actions::FILE_SYSTEM => Self::FileSystem {
                location: match content() {
                    Value::Null => None,
                    Value::String(location) => Some(location),
                    Value::Object(map) => map
                        .get("location")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    _ => {
                        return Err(CaptureError::invalid_request(
                            action,
                            "content must be a directory location",
                        ));
                    }
                },
            },
            actions::FILE_SYSTEM_SINGLE_OPERATION => {
                let content: SingleOperationContent = serde_json::from_value(content())
                    .map_err(|e| CaptureError::invalid_request(action, e.to_string()))?;
                Self::FileSystemSingleOperation {
                    id: content.id,
                    location: content.location,
                    name: content.name,
                }
            }
            actions::UPDATE_CHOICES => match content() {
                Value::Object(map) => Self::UpdateChoices(map),
                Value::Null => Self::UpdateChoices(Map::new()),
                _ => {
                    return Err(CaptureError::invalid_request(
                        action,
                        "content must be an object",
                    ));
                }
            },
            actions::GET_CHOICES => Self::GetChoices,
            other => return Err(CaptureError::UnknownAction(other.to_owned())),
        };
        Ok(command)
    }
}

/// Executes control commands against one registry.
pub struct CommandDispatcher {
    registry: Arc<CaptureRegistry>,
    picker: Arc<dyn DirectoryPicker>,
    slot: Arc<MediaSourceSlot>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<CaptureRegistry>,
        picker: Arc<dyn DirectoryPicker>,
        slot: Arc<MediaSourceSlot>,
    ) -> Self {
        Self {
            registry,
            picker,
            slot,
        }
    }

    pub fn registry(&self) -> &Arc<CaptureRegistry> {
        &self.registry
    }

    /// Listen on `bus` as the page until `cancel` fires.
    pub fn spawn(self: Arc<Self>, bus: &ControlBus, cancel: CancellationToken) -> JoinHandle<()> {
        let endpoint = bus.endpoint(Origin::Page);
        tokio::spawn(self.run(endpoint, cancel))
    }

    async fn run(self: Arc<Self>, mut endpoint: ChannelEndpoint, cancel: CancellationToken) {
        info!("Command dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = endpoint.recv() => {
                    let Some(request) = request else { break };
                    if let Some(response) = Arc::clone(&self).dispatch(&request).await {
                        endpoint.post(response);
                    }
                }
            }
        }
        info!("Command dispatcher stopped");
    }

    /// Handle one request. Failures are logged and produce no answer.
    pub async fn dispatch(self: Arc<Self>, request: &ControlRequest) -> Option<ControlRequest> {
        match Command::try_from(request) {
            Ok(command) => self.execute(command).await,
            Err(e) => {
                warn!(action = %request.action, error = %e, "Ignoring control message");
                None
            }
        }
    }

    pub async fn execute(self: Arc<Self>, command: Command) -> Option<ControlRequest> {
        debug!(?command, "Executing control command");
        match command {
            Command::Ping => Some(pong()),
            Command::Start => {
                self.registry.start(&self.slot);
                None
            }
            Command::Stop => {
                self.registry.stop();
                None
            }
            Command::GetDownloads {
                everything,
                context,
            } => {
                let entries = self.registry.downloads(everything);
                match serde_json::to_value(entries) {
                    Ok(content) => Some(
                        ControlRequest::new(actions::GET_DOWNLOADS)
                            .with_content(content)
                            .with_context(context),
                    ),
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize downloads");
                        None
                    }
                }
            }
            Command::DownloadThis { id } => {
                match self.registry.download(&id).await {
                    Ok(true) => {}
                    Ok(false) => debug!(stream_id = %id, "Nothing to download"),
                    Err(e) => warn!(stream_id = %id, error = %e, "Download failed"),
                }
                None
            }
            Command::DeleteThis { id, permanent } => {
                if !self.registry.delete_stream(&id, permanent) {
                    debug!(stream_id = %id, "Delete of unknown stream ignored");
                }
                None
            }
            Command::FsFinalize { id } => {
                if let Err(e) = self.registry.finalize(&id).await {
                    log_failure(&id, "Finalize", &e);
                }
                None
            }
            Command::FileSystem { location } => {
                let dispatcher = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.grant(location).await {
                        warn!(error = %e, "Directory grant failed, streams stay in memory");
                    }
                });
                None
            }
            Command::FileSystemSingleOperation { id, location, name } => {
                if let Err(e) = self.attach_single(&id, &location, name).await {
                    log_failure(&id, "Single-file attach", &e);
                }
                None
            }
            Command::UpdateChoices(update) => {
                let prefs = self.registry.update_preferences(&update);
                Some(choices_message(prefs))
            }
            Command::GetChoices => Some(choices_message(self.registry.preferences())),
        }
    }

    /// Obtain a directory and migrate every tracked stream into it.
    pub async fn grant(&self, location: Option<String>) -> Result<usize> {
        let directory = match location {
            Some(location) => self.picker.open(&location).await?,
            None => self.picker.pick(&self.registry.config().picker_id).await?,
        };
        Ok(self.registry.grant_directory(directory).await)
    }

    async fn attach_single(&self, id: &str, location: &str, name: Option<String>) -> Result<u64> {
        let name = match name {
            Some(name) => name,
            None => self
                .registry
                .inspect(id, |stream| stream.title().to_owned())
                .ok_or_else(|| CaptureError::stream_not_found(id))?,
        };
        let directory = self.picker.open(location).await?;
        self.registry.attach_to_file(id, directory, &name).await
    }
}

fn choices_message(prefs: Preferences) -> ControlRequest {
    let content = serde_json::to_value(prefs).unwrap_or(Value::Null);
    ControlRequest::new(actions::GET_CHOICES).with_content(content)
}

fn log_failure(id: &str, operation: &str, error: &CaptureError) {
    if error.is_stale_reference() {
        debug!(stream_id = %id, operation, "Stream already gone");
    } else {
        warn!(stream_id = %id, operation, error = %error, "Control operation failed");
    }
}
