//! Exercises the full path a dynamically host-registered endpoint takes:
//! `register_remote_method` over the Unix socket, then an HTTP request
//! routed through the multiplexer to the mock host and a reply routed back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gateway::auth::AuthGate;
use gateway::config::GatewayConfig;
use gateway::host_link::HostLink;
use gateway::state::AppState;
use gateway_test_utils::MockHost;
use tokio::sync::RwLock;

async fn start_gateway(socket_path: &std::path::Path) -> (SocketAddr, String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig::default();
    config.api_key_path = dir.path().to_path_buf();
    config.require_auth = false;
    let config = Arc::new(RwLock::new(config));
    let auth = AuthGate::load_or_create(Arc::clone(&config)).unwrap();
    let key = auth.current_key().await;
    let (state, outbound_rx) = AppState::new(config, auth);

    let host_link = HostLink::new(
        socket_path.to_path_buf(),
        state.registry.clone(),
        state.server_state.clone(),
        state.multiplexer.clone(),
        state.event_router.clone(),
        state.config.clone(),
    );
    tokio::spawn(async move {
        let _ = host_link.run(outbound_rx).await;
    });

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
async fn dynamic_endpoint_round_trips_through_the_mock_host() {
    let socket_dir = tempfile::tempdir().unwrap();
    let socket_path = socket_dir.path().join("moonraker.sock");
    let mock_host = MockHost::bind(&socket_path).await.unwrap();

    let (addr, _key, _dir) = start_gateway(&socket_path).await;

    let mut conn = mock_host.accept().await.unwrap();
    conn.send(serde_json::json!({
        "method": "register_remote_method",
        "params": {
            "endpoint": "/printer/info",
            "http_methods": ["GET"],
            "remote_method": "info",
        },
    }))
    .await
    .unwrap();
    conn.send(serde_json::json!({"method": "set_klippy_ready"}))
        .await
        .unwrap();

    // Give the host link a moment to process both notifications before the
    // HTTP request races in.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = reqwest::Client::new();
    let request = tokio::spawn({
        let url = format!("http://{addr}/printer/info");
        async move { client.get(url).send().await.unwrap() }
    });

    let host_request = conn.recv().await.unwrap();
    assert_eq!(host_request.method.as_deref(), Some("info"));
    let id = host_request.id.expect("request from the gateway must carry an id");
    conn.send(serde_json::json!({
        "id": id,
        "is_response": true,
        "result": {"state": "ready"},
    }))
    .await
    .unwrap();

    let response = request.await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"]["state"], "ready");
}

#[tokio::test]
async fn unregistered_endpoint_is_rejected_without_reaching_the_host() {
    let socket_dir = tempfile::tempdir().unwrap();
    let socket_path = socket_dir.path().join("moonraker.sock");
    let _mock_host = MockHost::bind(&socket_path).await.unwrap();

    let (addr, _key, _dir) = start_gateway(&socket_path).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/printer/does_not_exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}
