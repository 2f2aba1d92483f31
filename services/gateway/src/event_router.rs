//! Fan out host-originated notifications to every open WebSocket.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;

pub struct EventRouter {
    tx: broadcast::Sender<Value>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    /// Broadcast a JSON-RPC notification envelope to every current subscriber.
    /// Best-effort: if nobody is listening this is a no-op, not an error.
    pub fn publish(&self, notification: Value) {
        match self.tx.send(notification) {
            Ok(n) => debug!(receivers = n, "notification broadcast"),
            Err(_) => debug!("notification broadcast with no subscribers"),
        }
    }
}

/// Drain `rx` into `sink`, forwarding each notification until the sender is
/// dropped or `sink` can no longer accept messages. A lagging consumer
/// skips the missed notifications rather than blocking the broadcast.
pub async fn forward_to_connection(
    mut rx: broadcast::Receiver<Value>,
    sink: tokio::sync::mpsc::UnboundedSender<Value>,
) {
    loop {
        match rx.recv().await {
            Ok(value) => {
                if sink.send(value).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "websocket consumer lagged, dropping notifications");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
