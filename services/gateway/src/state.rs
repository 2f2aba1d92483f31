//! `AppState`: the handle every HTTP/WS route shares, one `Arc<...>` field
//! per concern, constructed once in `main` and cloned into the router.

use std::sync::Arc;

use gateway_protocol::{HostRequest, ServerState};
use tokio::sync::{RwLock, mpsc};

use crate::auth::AuthGate;
use crate::config::GatewayConfig;
use crate::event_router::EventRouter;
use crate::multiplexer::RequestMultiplexer;
use crate::registry::EndpointRegistry;
use crate::subscriptions::SubscriptionEngine;
use crate::temperature::TemperatureStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<GatewayConfig>>,
    pub registry: Arc<RwLock<EndpointRegistry>>,
    pub server_state: Arc<RwLock<ServerState>>,
    pub multiplexer: Arc<RequestMultiplexer>,
    pub subscriptions: Arc<SubscriptionEngine>,
    pub event_router: Arc<EventRouter>,
    pub temperature: Arc<TemperatureStore>,
    pub auth: Arc<AuthGate>,
}

impl AppState {
    /// `config` is shared with the `AuthGate` the caller already built from
    /// the same handle, so a host `register_config` overlay is visible to
    /// every consumer (routing, timeouts, polling, *and* auth) at once.
    pub fn new(
        config: Arc<RwLock<GatewayConfig>>,
        auth: AuthGate,
    ) -> (Self, mpsc::UnboundedReceiver<HostRequest>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RwLock::new(EndpointRegistry::default()));
        let server_state = Arc::new(RwLock::new(ServerState::Disconnected));
        let multiplexer = RequestMultiplexer::new(
            outbound_tx,
            Arc::clone(&registry),
            Arc::clone(&server_state),
            Arc::clone(&config),
        );
        let temperature = Arc::new(TemperatureStore::new());
        let subscriptions = SubscriptionEngine::new(
            Arc::clone(&config),
            Arc::clone(&multiplexer),
            Arc::clone(&temperature),
        );
        let event_router = Arc::new(EventRouter::new());

        let state = Self {
            config,
            registry,
            server_state,
            multiplexer,
            subscriptions,
            event_router,
            temperature,
            auth: Arc::new(auth),
        };
        (state, outbound_rx)
    }
}
