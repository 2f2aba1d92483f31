//! `/access/api_key` and `/access/oneshot_token`.

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use std::net::SocketAddr;

use gateway_protocol::HttpResultBody;

use crate::http::{authenticate, authenticate_trusted};
use crate::state::AppState;

pub async fn get_api_key(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    let key = state.auth.current_key().await;
    axum::Json(HttpResultBody::new(key)).into_response()
}

pub async fn rotate_api_key(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    match state.auth.rotate().await {
        Ok(key) => axum::Json(HttpResultBody::new(key)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Minting a one-shot token requires the caller to already be trusted by
/// subnet (or have auth disabled outright) — an API key alone does not
/// qualify, or a key holder could farm tokens indefinitely.
pub async fn get_oneshot_token(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    if let Err(e) = authenticate_trusted(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    let token = state.auth.mint_one_shot_token().await;
    axum::Json(HttpResultBody::new(token)).into_response()
}
