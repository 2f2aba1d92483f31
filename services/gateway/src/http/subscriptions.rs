//! `GET|POST /printer/subscriptions` and `GET /server/temperature_store`.
//!
//! HTTP has no persistent connection to push `notify_status_update` over, so
//! HTTP-originated subscriptions share one synthetic connection id and an
//! outbound channel whose receiving end is dropped immediately: the object
//! still joins the tier poll (and so is covered by subscription coalescing),
//! but fan-out to it is a harmless no-op send failure, logged at `debug` by
//! the engine. Real per-client delivery is a WebSocket-only concern; see
//! `http::ws`.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, Uri};
use axum::response::IntoResponse;
use serde_json::Value;

use gateway_protocol::HttpResultBody;

use crate::http::authenticate;
use crate::state::AppState;

/// Every HTTP-originated subscription record is filed under this id; there
/// is exactly one such pseudo-client, shared across all HTTP callers.
const HTTP_CONN_ID: u64 = 0;

pub async fn get_subscriptions(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    let (objects, poll_times) = state.subscriptions.current(HTTP_CONN_ID).await;
    axum::Json(HttpResultBody::new(
        serde_json::json!({"objects": objects, "poll_times": poll_times}),
    ))
    .into_response()
}

pub async fn post_subscriptions(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    let mut requests: HashMap<String, Vec<String>> = HashMap::new();

    for (object, attrs) in query {
        let list = if attrs.is_empty() {
            Vec::new()
        } else {
            attrs.split(',').map(str::to_owned).collect()
        };
        requests.insert(object, list);
    }

    if !body.is_empty() {
        if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&body) {
            for (object, attrs) in map {
                let list = match attrs {
                    Value::Array(items) => items
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect(),
                    _ => Vec::new(),
                };
                requests.insert(object, list);
            }
        }
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    drop(rx);
    state.subscriptions.subscribe(HTTP_CONN_ID, tx, requests).await;

    axum::Json(HttpResultBody::new("ok")).into_response()
}

pub async fn get_temperature_store(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    let snapshot = state.temperature.snapshot().await;
    axum::Json(HttpResultBody::new(snapshot)).into_response()
}
