//! `/machine/shutdown` and `/machine/reboot`. These never reach the host:
//! they are local OS-level actions the gateway performs itself, gated on
//! the same auth check as any other surface route.

use std::net::SocketAddr;
use std::process::Stdio;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Uri};
use axum::response::IntoResponse;
use tracing::{error, warn};

use gateway_protocol::HttpResultBody;

use crate::error::GatewayError;
use crate::http::authenticate;
use crate::state::AppState;

pub async fn shutdown(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    match do_power_command(&["-h", "now"]).await {
        Ok(()) => axum::Json(HttpResultBody::new("ok")).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn reboot(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    match do_power_command(&["-r", "now"]).await {
        Ok(()) => axum::Json(HttpResultBody::new("ok")).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Shell out to `sudo shutdown <args>`, used by both the HTTP handlers above
/// and the WebSocket surface's `post_machine_shutdown`/`post_machine_reboot`.
pub async fn do_power_command(shutdown_args: &[&str]) -> Result<(), GatewayError> {
    warn!(args = ?shutdown_args, "issuing system power command");
    let result = tokio::process::Command::new("sudo")
        .arg("shutdown")
        .args(shutdown_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn();

    match result {
        Ok(mut child) => {
            tokio::spawn(async move {
                if let Ok(status) = child.wait().await {
                    if !status.success() {
                        error!(?status, "power command exited non-zero");
                    }
                }
            });
            Ok(())
        }
        Err(e) => Err(GatewayError::Internal(format!("failed to spawn shutdown command: {e}"))),
    }
}
