// gateway-test-utils: shared test helpers for the gateway's integration
// suite — a mock printer host over a real Unix socket, and a mock JSON-RPC
// WebSocket client.

pub mod mock_host;
pub mod mock_ws_client;

pub use mock_host::{MockHost, MockHostConn};
pub use mock_ws_client::MockWsClient;
