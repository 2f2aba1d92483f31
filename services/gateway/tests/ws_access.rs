//! `/websocket` JSON-RPC surface: method-to-path dispatch and the
//! trusted-only gate on `get_access_oneshot_token` carried over from the
//! connection's admission, not re-derived per call.

use std::net::SocketAddr;
use std::sync::Arc;

use gateway::auth::AuthGate;
use gateway::config::GatewayConfig;
use gateway::state::AppState;
use gateway_test_utils::MockWsClient;
use tokio::sync::RwLock;

async fn start_gateway(require_auth: bool) -> (SocketAddr, String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig::default();
    config.api_key_path = dir.path().to_path_buf();
    config.require_auth = require_auth;
    let config = Arc::new(RwLock::new(config));
    let auth = AuthGate::load_or_create(Arc::clone(&config)).unwrap();
    let key = auth.current_key().await;
    let (state, _outbound_rx) = AppState::new(config, auth);

    let router = gateway::http::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    (addr, key, dir)
}

#[tokio::test]
async fn api_key_holder_cannot_mint_a_oneshot_token_over_the_socket() {
    let (addr, key, _dir) = start_gateway(true).await;
    let req = format!("ws://{addr}/websocket");
    let mut client = connect_with_api_key(&req, &key).await;

    let resp = client
        .call(1, "get_access_oneshot_token", serde_json::json!({}))
        .await
        .unwrap();
    assert!(resp.get("error").is_some(), "api key alone must not mint one-shot tokens");
}

#[tokio::test]
async fn trusted_connection_can_mint_a_oneshot_token() {
    let (addr, _key, _dir) = start_gateway(false).await;
    let mut client = MockWsClient::connect(&format!("ws://{addr}/websocket"))
        .await
        .unwrap();

    let resp = client
        .call(1, "get_access_oneshot_token", serde_json::json!({}))
        .await
        .unwrap();
    assert!(resp.get("result").is_some());
}

#[tokio::test]
async fn unknown_method_returns_method_not_found() {
    let (addr, _key, _dir) = start_gateway(false).await;
    let mut client = MockWsClient::connect(&format!("ws://{addr}/websocket"))
        .await
        .unwrap();

    let resp = client.call(1, "not_a_real_verb", serde_json::json!({})).await.unwrap();
    assert_eq!(resp["error"]["code"], -32601);
}

async fn connect_with_api_key(url: &str, key: &str) -> MockWsClient {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderName;

    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert(HeaderName::from_static("x-api-key"), key.parse().unwrap());
    let (ws_stream, _resp) = tokio_tungstenite::connect_async(request).await.unwrap();
    MockWsClient::from_stream(ws_stream)
}
