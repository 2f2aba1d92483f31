//! Owns the Unix-domain listening socket the host connects to, and the
//! read/write loops for whichever peer is currently connected. A new peer
//! supersedes whatever connection came before it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{RwLock, mpsc};
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

use gateway_protocol::{HostRequest, JsonRpcNotification, ServerState};

use crate::codec::HostFrameCodec;
use crate::config::GatewayConfig;
use crate::event_router::EventRouter;
use crate::multiplexer::RequestMultiplexer;
use crate::registry::{EndpointInfo, EndpointRegistry};

pub struct HostLink {
    socket_path: PathBuf,
    registry: Arc<RwLock<EndpointRegistry>>,
    server_state: Arc<RwLock<ServerState>>,
    multiplexer: Arc<RequestMultiplexer>,
    event_router: Arc<EventRouter>,
    config: Arc<RwLock<GatewayConfig>>,
}

impl HostLink {
    pub fn new(
        socket_path: PathBuf,
        registry: Arc<RwLock<EndpointRegistry>>,
        server_state: Arc<RwLock<ServerState>>,
        multiplexer: Arc<RequestMultiplexer>,
        event_router: Arc<EventRouter>,
        config: Arc<RwLock<GatewayConfig>>,
    ) -> Self {
        Self {
            socket_path,
            registry,
            server_state,
            multiplexer,
            event_router,
            config,
        }
    }

    /// Bind the socket and accept host connections forever, one at a time.
    /// The accept loop does not resume until the current session's
    /// read/write loop has fully unwound, so there is never more than one
    /// live peer.
    pub async fn run(self, mut outbound: mpsc::UnboundedReceiver<HostRequest>) -> std::io::Result<()> {
        let listener = bind_fresh(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "host link listening");

        // The outbound queue is shared across reconnects: whichever peer is
        // live at the moment drains it. We re-wrap it in an Option so it can
        // be handed to each session's writer in turn.
        let outbound = Arc::new(tokio::sync::Mutex::new(outbound));

        loop {
            let (stream, _addr) = listener.accept().await?;
            info!("host connected");
            self.reset_for_new_connection().await;

            let session = HostSession {
                registry: Arc::clone(&self.registry),
                server_state: Arc::clone(&self.server_state),
                multiplexer: Arc::clone(&self.multiplexer),
                event_router: Arc::clone(&self.event_router),
                config: Arc::clone(&self.config),
            };
            let outbound = Arc::clone(&outbound);
            session.run(stream, outbound).await;
            warn!("host disconnected");
        }
    }

    async fn reset_for_new_connection(&self) {
        *self.server_state.write().await = ServerState::Connecting;
        self.registry.write().await.clear();
    }
}

fn bind_fresh(path: &Path) -> std::io::Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path)
}

struct HostSession {
    registry: Arc<RwLock<EndpointRegistry>>,
    server_state: Arc<RwLock<ServerState>>,
    multiplexer: Arc<RequestMultiplexer>,
    event_router: Arc<EventRouter>,
    config: Arc<RwLock<GatewayConfig>>,
}

impl HostSession {
    async fn run(
        self,
        stream: UnixStream,
        outbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<HostRequest>>>,
    ) {
        let framed = Framed::new(stream, HostFrameCodec);
        let (mut sink, mut source) = framed.split();

        loop {
            let mut outbound_guard = outbound.lock().await;
            tokio::select! {
                biased;

                frame = source.next() => {
                    drop(outbound_guard);
                    match frame {
                        Some(Ok(bytes)) => {
                            if let Err(e) = self.dispatch(&bytes).await {
                                error!(%e, "malformed frame from host, tearing down link");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!(%e, "host link read error");
                            break;
                        }
                        None => break,
                    }
                }

                request = outbound_guard.recv() => {
                    match request {
                        Some(request) => {
                            let payload = match serde_json::to_vec(&request) {
                                Ok(p) => p,
                                Err(e) => {
                                    error!(%e, "failed to serialize outbound host request");
                                    continue;
                                }
                            };
                            drop(outbound_guard);
                            if let Err(e) = sink.send(payload).await {
                                error!(%e, "host link write error");
                                break;
                            }
                        }
                        None => {
                            drop(outbound_guard);
                        }
                    }
                }
            }
        }

        *self.server_state.write().await = ServerState::Disconnected;
        self.registry.write().await.clear();
        self.multiplexer.fail_all("host disconnected").await;
        self.event_router.publish(
            serde_json::to_value(JsonRpcNotification::new(
                "notify_klippy_state_changed",
                serde_json::json!("disconnect"),
            ))
            .unwrap(),
        );
    }

    async fn dispatch(&self, bytes: &[u8]) -> Result<(), serde_json::Error> {
        let env: gateway_protocol::HostEnvelope = serde_json::from_slice(bytes)?;

        if env.is_response {
            if let Some(id) = env.id {
                let error = env.error.map(|e| e.message);
                self.multiplexer.handle_reply(id, env.result, error).await;
            }
            return Ok(());
        }

        let Some(method) = env.method.as_deref() else {
            warn!("host frame with neither is_response nor method, ignoring");
            return Ok(());
        };

        match method {
            "register_remote_method" => self.handle_register(env.params).await,
            "register_config" => self.handle_register_config(env.params).await,
            "set_klippy_ready" => self.transition(ServerState::Ready).await,
            "set_klippy_disconnect" => self.transition(ServerState::Disconnected).await,
            "set_klippy_shutdown" => self.transition(ServerState::Shutdown).await,
            "process_gcode_response" => self.forward_notification("notify_gcode_response", env.params),
            "process_filelist_change" => self.forward_notification("notify_filelist_changed", env.params),
            "process_status_update" => self.forward_notification("notify_status_update", env.params),
            other => {
                warn!(method = other, "unrecognized host notification, ignoring");
            }
        }
        Ok(())
    }

    async fn handle_register(&self, params: Value) {
        let Ok(reg) = serde_json::from_value::<gateway_protocol::RegisterRemoteMethod>(params) else {
            warn!("malformed register_remote_method, ignoring");
            return;
        };
        if *self.server_state.read().await == ServerState::Shutdown {
            return;
        }
        *self.server_state.write().await = ServerState::Initializing;
        self.registry.write().await.register(
            reg.endpoint.clone(),
            EndpointInfo {
                http_methods: reg.http_methods,
                remote_method: reg.remote_method,
                request_timeout: reg.request_timeout,
            },
        );
        info!(endpoint = %reg.endpoint, "endpoint registered");
    }

    /// Merge the host's config notification over the current config: fields
    /// the host omits keep their file/CLI-loaded value, and nothing is
    /// written back to disk.
    async fn handle_register_config(&self, params: Value) {
        let base = self.config.read().await.clone();
        match crate::config::apply_host_config(&base, params) {
            Ok(merged) => {
                *self.config.write().await = merged;
                info!("applied host-supplied config");
            }
            Err(e) => warn!(%e, "rejected malformed register_config notification"),
        }
    }

    async fn transition(&self, state: ServerState) {
        *self.server_state.write().await = state;
        if state != ServerState::Ready {
            self.registry.write().await.clear();
            self.multiplexer.fail_all("host disconnected").await;
        }
        let label = match state {
            ServerState::Disconnected => "disconnect",
            ServerState::Connecting => "connecting",
            ServerState::Initializing => "initializing",
            ServerState::Ready => "ready",
            ServerState::Shutdown => "shutdown",
        };
        self.forward_notification("notify_klippy_state_changed", serde_json::json!(label));
        info!(?state, "server state changed");
    }

    fn forward_notification(&self, method: &str, param: Value) {
        let notification = JsonRpcNotification::new(method, param);
        self.event_router
            .publish(serde_json::to_value(&notification).unwrap());
    }
}
