//! The request multiplexer: correlation-id allocation, the pending-request
//! table, per-request timeout enforcement, and translation of host replies
//! back into the shape the originating client surface expects.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, warn};

use gateway_protocol::{HostRequest, ServerState};

use crate::config::{GatewayConfig, gcode_timeout_override};
use crate::error::GatewayError;
use crate::registry::EndpointRegistry;

/// Where a resolved reply gets delivered.
pub enum ClientHandle {
    /// A single HTTP request awaiting one reply.
    Http(oneshot::Sender<Result<Value, String>>),
    /// A WebSocket connection's JSON-RPC call; `reply_id` is the JSON-RPC id
    /// the caller used, echoed back verbatim.
    Ws {
        outbound: mpsc::UnboundedSender<Value>,
        reply_id: Value,
    },
}

impl ClientHandle {
    fn fulfill(self, outcome: Result<Value, String>) {
        match self {
            ClientHandle::Http(tx) => {
                let _ = tx.send(outcome);
            }
            ClientHandle::Ws { outbound, reply_id } => {
                let msg = match outcome {
                    Ok(result) => serde_json::json!({"jsonrpc": "2.0", "result": result, "id": reply_id}),
                    Err(message) => serde_json::json!({
                        "jsonrpc": "2.0",
                        "error": {"code": -32603, "message": message},
                        "id": reply_id,
                    }),
                };
                let _ = outbound.send(msg);
            }
        }
    }
}

struct PendingEntry {
    client: ClientHandle,
}

pub struct RequestMultiplexer {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    outbound: mpsc::UnboundedSender<HostRequest>,
    registry: Arc<RwLock<EndpointRegistry>>,
    server_state: Arc<RwLock<ServerState>>,
    config: Arc<RwLock<GatewayConfig>>,
}

impl RequestMultiplexer {
    pub fn new(
        outbound: mpsc::UnboundedSender<HostRequest>,
        registry: Arc<RwLock<EndpointRegistry>>,
        server_state: Arc<RwLock<ServerState>>,
        config: Arc<RwLock<GatewayConfig>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
            registry,
            server_state,
            config,
        })
    }

    /// Submit a client request bound for `endpoint`. On success, the
    /// outcome is eventually delivered to `client` via `handle_reply` or a
    /// timeout; this function itself only returns acceptance/rejection.
    pub async fn submit(
        self: &Arc<Self>,
        endpoint: &str,
        args: Value,
        client: ClientHandle,
    ) -> Result<(), GatewayError> {
        if *self.server_state.read().await != ServerState::Ready {
            return Err(GatewayError::HostDisconnected);
        }
        let info = {
            let reg = self.registry.read().await;
            reg.get(endpoint).cloned()
        };
        let Some(info) = info else {
            return Err(GatewayError::NotFound(endpoint.to_owned()));
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timeout = self.resolve_timeout(endpoint, &info, &args).await;

        self.pending.lock().await.insert(id, PendingEntry { client });

        let request = HostRequest {
            id,
            method: info.remote_method.clone(),
            params: args,
        };
        if self.outbound.send(request).is_err() {
            self.fail_one(id, "host disconnected".to_owned()).await;
            return Ok(());
        }

        if let Some(secs) = timeout {
            let weak_self = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                if let Some(this) = weak_self.upgrade() {
                    this.fail_one(id, "request timed out".to_owned()).await;
                }
            });
        }
        Ok(())
    }

    /// Issue a host request that bypasses the endpoint registry and carries
    /// no deadline. Used by the subscription engine's tiered poller, which
    /// is not a client-routable endpoint and has no timeout override.
    pub async fn submit_internal(
        self: &Arc<Self>,
        method: &str,
        params: Value,
    ) -> oneshot::Receiver<Result<Value, String>> {
        let (tx, rx) = oneshot::channel();
        if *self.server_state.read().await != ServerState::Ready {
            let _ = tx.send(Err("server not ready".to_owned()));
            return rx;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .await
            .insert(id, PendingEntry { client: ClientHandle::Http(tx) });
        let request = HostRequest {
            id,
            method: method.to_owned(),
            params,
        };
        if self.outbound.send(request).is_err() {
            self.fail_one(id, "host disconnected".to_owned()).await;
        }
        rx
    }

    async fn resolve_timeout(
        &self,
        endpoint: &str,
        info: &crate::registry::EndpointInfo,
        args: &Value,
    ) -> Option<f64> {
        let config = self.config.read().await;
        if endpoint == "/printer/gcode" {
            let script = args.get("script").and_then(Value::as_str).unwrap_or("");
            return gcode_timeout_override(&config, script);
        }
        if let Some(secs) = info.request_timeout {
            return Some(secs);
        }
        if let Some(secs) = config.long_running_requests.get(&endpoint.to_uppercase()) {
            return Some(*secs);
        }
        Some(config.request_timeout)
    }

    /// Fulfill a single pending entry with a terminal error, if still present.
    async fn fail_one(&self, id: u64, message: String) {
        if let Some(entry) = self.pending.lock().await.remove(&id) {
            debug!(id, %message, "pending request resolved with error");
            entry.client.fulfill(Err(message));
        }
    }

    /// Route a host reply back to its originating client.
    pub async fn handle_reply(&self, id: u64, result: Option<Value>, error: Option<String>) {
        let Some(entry) = self.pending.lock().await.remove(&id) else {
            warn!(id, "late or unknown reply dropped");
            return;
        };
        match error {
            Some(message) => entry.client.fulfill(Err(message)),
            None => entry.client.fulfill(Ok(result.unwrap_or(Value::Null))),
        }
    }

    /// The host link tore down; every outstanding request fails.
    pub async fn fail_all(&self, message: &str) {
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            entry.client.fulfill(Err(message.to_owned()));
        }
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
