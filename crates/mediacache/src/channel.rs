//! The control bus between the page-side engine and its bridge.
//!
//! Every participant posts onto one broadcast bus and hears everything,
//! including its own messages. A two-valued origin tag is the only echo
//! filter: an endpoint skips messages stamped with its own origin. A third
//! participant sharing an origin would see the other's messages as its own
//! and drop them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{trace, warn};

use crate::config::CaptureConfig;

/// Action names understood by the dispatcher.
pub mod actions {
    pub const PING: &str = "ping";
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const GET_DOWNLOADS: &str = "getDownloads";
    pub const DOWNLOAD_THIS: &str = "downloadThis";
    pub const DELETE_THIS: &str = "deleteThis";
    pub const FS_FINALIZE: &str = "fsFinalize";
    pub const FILE_SYSTEM: &str = "fileSystem";
    pub const FILE_SYSTEM_SINGLE_OPERATION: &str = "fileSystemSingleOperation";
    pub const UPDATE_CHOICES: &str = "updateChoices";
    pub const GET_CHOICES: &str = "getChoices";
}

/// Which side of the bus a message comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// The relay between an external controller and the page.
    #[serde(rename = "a")]
    Bridge,
    /// The capture engine itself.
    #[serde(rename = "b")]
    Page,
}

/// Body of a control message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub everything: bool,
}

impl ControlRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_context(mut self, context: Option<Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_everything(mut self, everything: bool) -> Self {
        self.everything = everything;
        self
    }

    pub fn is(&self, action: &str) -> bool {
        self.action == action
    }

    /// `content` as a string, for actions addressing one stream by id.
    pub fn content_str(&self) -> Option<&str> {
        self.content.as_ref().and_then(Value::as_str)
    }
}

/// A request stamped with its origin, as it travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(alias = "from")]
    pub origin: Origin,
    #[serde(flatten)]
    pub body: ControlRequest,
}

/// Broadcast bus shared by the bridge and the engine of one page.
#[derive(Clone)]
pub struct ControlBus {
    tx: broadcast::Sender<ControlMessage>,
}

impl ControlBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.bus_capacity)
    }

    /// Join the bus as `origin`. Only messages posted after this call are seen.
    pub fn endpoint(&self, origin: Origin) -> ChannelEndpoint {
        ChannelEndpoint {
            origin,
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Number of endpoints currently listening.
    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One participant's view of the bus.
pub struct ChannelEndpoint {
    origin: Origin,
    tx: broadcast::Sender<ControlMessage>,
    rx: broadcast::Receiver<ControlMessage>,
}

impl ChannelEndpoint {
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Stamp `request` with this endpoint's origin and broadcast it.
    /// Returns `false` when nobody is listening.
    pub fn post(&self, request: ControlRequest) -> bool {
        trace!(origin = ?self.origin, action = %request.action, "Posting control message");
        self.tx
            .send(ControlMessage {
                origin: self.origin,
                body: request,
            })
            .is_ok()
    }

    /// Next message from the other side, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<ControlRequest> {
        loop {
            match self.rx.recv().await {
                Ok(message) if message.origin == self.origin => continue,
                Ok(message) => return Some(message.body),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(origin = ?self.origin, skipped, "Control endpoint lagged, messages lost");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
