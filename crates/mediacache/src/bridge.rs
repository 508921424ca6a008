//! Relay between an external controller and the page bus.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::channel::{ChannelEndpoint, ControlBus, ControlRequest, Origin, actions};

pub const PONG: &str = "pong";

/// The `{action: "ping", content: "pong"}` liveness answer.
pub fn pong() -> ControlRequest {
    ControlRequest::new(actions::PING).with_content(Value::String(PONG.to_owned()))
}

fn is_pong(request: &ControlRequest) -> bool {
    request.is(actions::PING) && request.content_str() == Some(PONG)
}

/// Controller-side relay.
///
/// Requests handed to [`Bridge::handle`] are posted on the bus with the
/// bridge origin; everything the page posts comes out of the receiver
/// returned by [`Bridge::spawn`]. Pings are answered right here and never
/// reach the bus, so their answer only proves the bridge is resident.
pub struct Bridge {
    inbound: mpsc::UnboundedSender<ControlRequest>,
    task: JoinHandle<()>,
}

impl Bridge {
    pub fn spawn(bus: &ControlBus) -> (Self, mpsc::UnboundedReceiver<ControlRequest>) {
        let endpoint = bus.endpoint(Origin::Bridge);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(relay(endpoint, inbound_rx, outbound_tx));
        (
            Self {
                inbound: inbound_tx,
                task,
            },
            outbound_rx,
        )
    }

    /// Handle one controller request. Returns the immediate answer for pings.
    pub fn handle(&self, request: ControlRequest) -> Option<ControlRequest> {
        if request.is(actions::PING) {
            return Some(pong());
        }
        if self.inbound.send(request).is_err() {
            debug!("Bridge relay stopped, request dropped");
        }
        None
    }

    /// Stop relaying once every request handed over so far was posted.
    pub async fn shutdown(self) {
        drop(self.inbound);
        let _ = self.task.await;
    }
}

async fn relay(
    mut endpoint: ChannelEndpoint,
    mut inbound: mpsc::UnboundedReceiver<ControlRequest>,
    outbound: mpsc::UnboundedSender<ControlRequest>,
) {
    loop {
        tokio::select! {
            request = inbound.recv() => match request {
                Some(request) => {
                    endpoint.post(request);
                }
                None => break,
            },
            message = endpoint.recv() => match message {
                Some(message) => {
                    if outbound.send(message).is_err() {
                        debug!("Controller gone, bridge relay stopping");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!("Bridge relay stopped");
}

/// Ask whatever listens on `bus` for a pong.
///
/// `true` only when an engine answered within `timeout`.
pub async fn probe_engine(bus: &ControlBus, timeout: Duration) -> bool {
    let mut endpoint = bus.endpoint(Origin::Bridge);
    endpoint.post(ControlRequest::new(actions::PING));

    let answered = async {
        while let Some(message) = endpoint.recv().await {
            if is_pong(&message) {
                return true;
            }
        }
        false
    };
    tokio::time::timeout(timeout, answered)
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_ping_answered_without_touching_bus() {
        let bus = ControlBus::new(8);
        let mut page = bus.endpoint(Origin::Page);
        let (bridge, _out) = Bridge::spawn(&bus);

        let answer = bridge.handle(ControlRequest::new("ping")).unwrap();
        assert_eq!(
            serde_json::to_value(&answer).unwrap(),
            json!({"action": "ping", "content": "pong"})
        );

        assert!(bridge.handle(ControlRequest::new("stop")).is_none());
        bridge.shutdown().await;
        assert_eq!(page.recv().await.unwrap().action, "stop");
    }

    #[tokio::test]
    async fn test_page_messages_are_forwarded() {
        let bus = ControlBus::new(8);
        let page = bus.endpoint(Origin::Page);
        let (bridge, mut out) = Bridge::spawn(&bus);

        page.post(ControlRequest::new("getChoices").with_content(json!({})));
        let forwarded = out.recv().await.unwrap();
        assert_eq!(forwarded.action, "getChoices");

        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_times_out_without_engine() {
        let bus = ControlBus::new(8);
        assert!(!probe_engine(&bus, Duration::from_millis(200)).await);
    }
}
