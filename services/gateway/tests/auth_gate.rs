//! End-to-end auth coverage for the static HTTP surface: every route behind
//! `build_router` must reject a caller with no API key, no trusted address,
//! and no one-shot token, and must accept one with a valid key. Mirrors the
//! root `tests/integration/*.rs` style of binding a real listener and
//! driving it with a real HTTP client rather than calling handlers directly.

use std::net::SocketAddr;
use std::sync::Arc;

use gateway::auth::AuthGate;
use gateway::config::GatewayConfig;
use gateway::state::AppState;
use tokio::sync::RwLock;

async fn start_gateway() -> (SocketAddr, String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GatewayConfig::default();
    config.api_key_path = dir.path().to_path_buf();
    let config = Arc::new(RwLock::new(config));
    let auth = AuthGate::load_or_create(Arc::clone(&config)).unwrap();
    let api_key = auth.current_key().await;
    let (state, _outbound_rx) = AppState::new(config, auth);

    let router = gateway::http::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    (addr, api_key, dir)
}

#[tokio::test]
async fn unauthenticated_caller_is_rejected_on_every_static_route() {
    let (addr, _key, _dir) = start_gateway().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let routes = [
        (reqwest::Method::GET, "/printer/files"),
        (reqwest::Method::GET, "/printer/subscriptions"),
        (reqwest::Method::GET, "/server/temperature_store"),
        (reqwest::Method::GET, "/access/api_key"),
        (reqwest::Method::GET, "/printer/klippy.log"),
        (reqwest::Method::GET, "/server/moonraker.log"),
    ];

    for (method, path) in routes {
        let resp = client
            .request(method.clone(), format!("{base}{path}"))
            .send()
            .await
            .unwrap();
        assert_eq!(
            resp.status(),
            reqwest::StatusCode::UNAUTHORIZED,
            "{method} {path} should require auth"
        );
    }
}

#[tokio::test]
async fn valid_api_key_admits_the_caller() {
    let (addr, key, _dir) = start_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/printer/files"))
        .header("x-api-key", &key)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn oneshot_token_endpoint_rejects_plain_api_key_holders() {
    let (addr, key, _dir) = start_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/access/oneshot_token"))
        .header("x-api-key", &key)
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.status(),
        reqwest::StatusCode::UNAUTHORIZED,
        "an api key alone must not be able to mint one-shot tokens"
    );
}

#[tokio::test]
async fn download_file_rejects_path_traversal() {
    let (addr, key, _dir) = start_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/printer/files/..%2F.klippy_api_key"))
        .header("x-api-key", &key)
        .send()
        .await
        .unwrap();
    // axum's router treats `%2F` in a single path segment as a literal
    // component, so this either never matches the route or is rejected by
    // `sanitize_filename`; either way it must not succeed.
    assert_ne!(resp.status(), reqwest::StatusCode::OK);
}
