//! File list/upload/download/delete and log retrieval. These are static
//! surface endpoints, never routed through the host.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Multipart, Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;

use gateway_protocol::{FileInfo, FilelistChangePayload, HttpResultBody, JsonRpcNotification};

use crate::error::{GatewayError, GatewayResult};
use crate::http::authenticate;
use crate::multiplexer::ClientHandle;
use crate::state::AppState;

// Not itself a config option; anchored next to the API key file so a
// single `api_key_path` still determines where the gateway keeps its
// local state.
pub(crate) async fn resolved_files_dir(state: &AppState) -> PathBuf {
    let base = state.config.read().await.api_key_path.join("gcode_files");
    let _ = tokio::fs::create_dir_all(&base).await;
    base
}

pub(crate) async fn list_file_infos(dir: &Path) -> std::io::Result<Vec<FileInfo>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        out.push(FileInfo {
            filename: entry.file_name().to_string_lossy().into_owned(),
            size: meta.len(),
            modified,
        });
    }
    Ok(out)
}

fn broadcast_filelist_change(state: &AppState, action: &str, item: FileInfo) {
    let payload = FilelistChangePayload {
        action: action.to_owned(),
        item,
    };
    let param = serde_json::to_value(&payload).unwrap();
    let notification = JsonRpcNotification::new("notify_filelist_changed", param);
    state
        .event_router
        .publish(serde_json::to_value(&notification).unwrap());
}

/// Reject any filename carrying a path separator or a `..` component so a
/// request can never escape `resolved_files_dir`.
fn sanitize_filename(name: &str) -> Result<&str, GatewayError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.split('/').any(|part| part == "..") {
        return Err(GatewayError::BadRequest(format!("invalid filename '{name}'")));
    }
    Ok(name)
}

pub async fn list_files(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    let dir = resolved_files_dir(&state).await;
    match list_file_infos(&dir).await {
        Ok(files) => axum::Json(HttpResultBody::new(files)).into_response(),
        Err(e) => GatewayError::Io(e).into_response(),
    }
}

pub async fn download_file(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    AxumPath(filename): AxumPath<String>,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    let filename = match sanitize_filename(&filename) {
        Ok(f) => f,
        Err(e) => return e.into_response(),
    };
    let dir = resolved_files_dir(&state).await;
    match tokio::fs::read(dir.join(filename)).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(_) => GatewayError::NotFound(filename.to_owned()).into_response(),
    }
}

pub async fn delete_file(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    AxumPath(filename): AxumPath<String>,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    let filename = match sanitize_filename(&filename) {
        Ok(f) => f.to_owned(),
        Err(e) => return e.into_response(),
    };
    let dir = resolved_files_dir(&state).await;
    let path = dir.join(&filename);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            broadcast_filelist_change(
                &state,
                "delete_file",
                FileInfo {
                    filename: filename.clone(),
                    size: 0,
                    modified: 0.0,
                },
            );
            axum::Json(HttpResultBody::new(filename)).into_response()
        }
        Err(_) => GatewayError::NotFound(filename).into_response(),
    }
}

pub async fn upload_file(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    mut multipart: Multipart,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    let dir = resolved_files_dir(&state).await;
    let mut filename = None;
    let mut contents: Option<Bytes> = None;
    let mut should_print = false;

    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name() {
            Some("file") => {
                filename = field.file_name().map(str::to_owned);
                contents = field.bytes().await.ok();
            }
            Some("print") => {
                if let Ok(text) = field.text().await {
                    should_print = text == "true";
                }
            }
            _ => {}
        }
    }

    let (Some(filename), Some(contents)) = (filename, contents) else {
        return GatewayError::BadRequest("multipart field 'file' is required".to_owned()).into_response();
    };
    if let Err(e) = sanitize_filename(&filename) {
        return e.into_response();
    }

    if let Err(e) = tokio::fs::write(dir.join(&filename), &contents).await {
        return GatewayError::Io(e).into_response();
    }

    broadcast_filelist_change(
        &state,
        "create_file",
        FileInfo {
            filename: filename.clone(),
            size: contents.len() as u64,
            modified: 0.0,
        },
    );

    if should_print {
        if let Err(e) = start_print(&state, &filename).await {
            return e.into_response();
        }
    }

    axum::Json(HttpResultBody::new(serde_json::json!({"filename": filename}))).into_response()
}

async fn start_print(state: &AppState, filename: &str) -> GatewayResult<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    state
        .multiplexer
        .submit(
            "/printer/print/start",
            serde_json::json!({"filename": filename}),
            ClientHandle::Http(tx),
        )
        .await?;
    match rx.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(message)) => Err(GatewayError::HostError(message)),
        Err(_) => Err(GatewayError::Internal("print start reply channel dropped".to_owned())),
    }
}

pub async fn get_klippy_log(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    serve_log(&state, "klippy.log").await
}

pub async fn get_moonraker_log(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }
    serve_log(&state, "moonraker.log").await
}

async fn serve_log(state: &AppState, name: &str) -> axum::response::Response {
    let path = state.config.read().await.api_key_path.join(name);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(_) => GatewayError::NotFound(name.to_owned()).into_response(),
    }
}
