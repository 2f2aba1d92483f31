//! `GET /websocket` upgrade and JSON-RPC 2.0 dispatch: one reader loop and
//! one writer loop per connection, the writer fed by an
//! `mpsc::UnboundedSender` shared with the event router and the
//! subscription engine.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Uri};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gateway_protocol::{JsonRpcRequest, jsonrpc_error_codes as codes};

use crate::error::{GatewayError, json_rpc_error_value};
use crate::event_router::forward_to_connection;
use crate::http::authenticate_with_trust;
use crate::http::files::{list_file_infos, resolved_files_dir};
use crate::http::machine::do_power_command;
use crate::multiplexer::ClientHandle;
use crate::state::AppState;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub async fn handle_upgrade(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let trusted = match authenticate_with_trust(&state, remote, &headers, &uri).await {
        Ok(trusted) => trusted,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, trusted))
}

async fn handle_socket(socket: WebSocket, state: AppState, trusted: bool) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();

    let event_rx = state.event_router.subscribe();
    let forward_tx = outbound_tx.clone();
    let forward_task = tokio::spawn(forward_to_connection(event_rx, forward_tx));

    let writer_task = tokio::spawn(async move {
        while let Some(value) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&value) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state, conn_id, trusted, &outbound_tx, text.as_bytes()).await,
            Ok(Message::Binary(bytes)) => handle_frame(&state, conn_id, trusted, &outbound_tx, &bytes).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn_id, %e, "websocket read error");
                break;
            }
        }
    }

    state.subscriptions.unsubscribe_all(conn_id).await;
    forward_task.abort();
    drop(outbound_tx);
    let _ = writer_task.await;
}

async fn handle_frame(state: &AppState, conn_id: u64, trusted: bool, outbound: &mpsc::UnboundedSender<Value>, bytes: &[u8]) {
    let request: JsonRpcRequest = match serde_json::from_slice(bytes) {
        Ok(r) => r,
        Err(_) => {
            let _ = outbound.send(serde_json::json!({
                "jsonrpc": "2.0",
                "error": {"code": codes::PARSE_ERROR, "message": "invalid JSON-RPC request"},
                "id": Value::Null,
            }));
            return;
        }
    };

    let id = request.id.unwrap_or(Value::Null);

    let Some((method, path)) = parse_method(&request.method) else {
        let _ = outbound.send(serde_json::json!({
            "jsonrpc": "2.0",
            "error": {"code": codes::METHOD_NOT_FOUND, "message": "unknown method"},
            "id": id,
        }));
        return;
    };

    let args = match request.params {
        Value::Object(map) => Value::Object(map),
        Value::Null => Value::Object(serde_json::Map::new()),
        _ => {
            let _ = outbound.send(serde_json::json!({
                "jsonrpc": "2.0",
                "error": {"code": codes::INVALID_PARAMS, "message": "positional params are not supported"},
                "id": id,
            }));
            return;
        }
    };

    dispatch(state, conn_id, trusted, outbound, method, &path, args, id).await;
}

/// `get_X_Y_Z` -> `("GET", "/X/Y/Z")`, `post_X_Y_Z` -> `("POST", "/X/Y/Z")`.
fn parse_method(method: &str) -> Option<(&'static str, String)> {
    let (verb, rest) = if let Some(rest) = method.strip_prefix("get_") {
        ("GET", rest)
    } else if let Some(rest) = method.strip_prefix("post_") {
        ("POST", rest)
    } else {
        return None;
    };
    if rest.is_empty() {
        return None;
    }
    Some((verb, format!("/{}", rest.replace('_', "/"))))
}

/// Known local surface endpoints (not host-routed) bypass the multiplexer,
/// mirroring the static axum routes in `http::build_router`. Everything
/// else is forwarded to the host through the request multiplexer, exactly
/// like the HTTP fallback handler.
async fn dispatch(
    state: &AppState,
    conn_id: u64,
    trusted: bool,
    outbound: &mpsc::UnboundedSender<Value>,
    method: &'static str,
    path: &str,
    args: Value,
    id: Value,
) {
    let result = match (method, path) {
        ("GET", "/printer/subscriptions") => {
            let (objects, poll_times) = state.subscriptions.current(conn_id).await;
            Ok(serde_json::json!({"objects": objects, "poll_times": poll_times}))
        }
        ("POST", "/printer/subscriptions") => {
            let requests = parse_subscription_requests(&args);
            state
                .subscriptions
                .subscribe(conn_id, outbound.clone(), requests)
                .await;
            Ok(Value::String("ok".to_owned()))
        }
        ("GET", "/server/temperature_store") => {
            let snapshot = state.temperature.snapshot().await;
            serde_json::to_value(snapshot).map_err(|e| GatewayError::Internal(e.to_string()))
        }
        ("GET", "/access/api_key") => Ok(Value::String(state.auth.current_key().await)),
        ("POST", "/access/api_key") => match state.auth.rotate().await {
            Ok(key) => Ok(Value::String(key)),
            Err(e) => Err(GatewayError::Internal(e.to_string())),
        },
        ("GET", "/access/oneshot_token") => {
            if trusted {
                Ok(Value::String(state.auth.mint_one_shot_token().await))
            } else {
                Err(GatewayError::Unauthorized)
            }
        }
        ("POST", "/machine/shutdown") => do_power_command(&["-h", "now"]).await.map(|()| Value::String("ok".to_owned())),
        ("POST", "/machine/reboot") => do_power_command(&["-r", "now"]).await.map(|()| Value::String("ok".to_owned())),
        ("GET", "/printer/files") => {
            let dir = resolved_files_dir(state).await;
            list_file_infos(&dir)
                .await
                .map_err(GatewayError::Io)
                .and_then(|files| serde_json::to_value(files).map_err(|e| GatewayError::Internal(e.to_string())))
        }
        _ => {
            submit_to_host(state, path, args, outbound.clone(), id.clone()).await;
            return;
        }
    };

    match result {
        Ok(value) => {
            let _ = outbound.send(serde_json::json!({"jsonrpc": "2.0", "result": value, "id": id}));
        }
        Err(e) => {
            let _ = outbound.send(json_rpc_error_value(id, &e));
        }
    }
}

fn parse_subscription_requests(args: &Value) -> std::collections::HashMap<String, Vec<String>> {
    let mut out = std::collections::HashMap::new();
    if let Some(map) = args.as_object() {
        for (object, attrs) in map {
            let list = match attrs {
                Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect(),
                _ => Vec::new(),
            };
            out.insert(object.clone(), list);
        }
    }
    out
}

/// Forward to the multiplexer exactly like the HTTP dynamic fallback: if
/// `submit` itself rejects the call (unready server, unknown endpoint,
/// wrong method), reply with a JSON-RPC error directly since no pending
/// entry was ever created. Otherwise the multiplexer delivers the eventual
/// reply straight to `outbound` via `ClientHandle::Ws`.
async fn submit_to_host(state: &AppState, path: &str, args: Value, outbound: mpsc::UnboundedSender<Value>, id: Value) {
    let client = ClientHandle::Ws {
        outbound: outbound.clone(),
        reply_id: id.clone(),
    };
    if let Err(e) = state.multiplexer.submit(path, args, client).await {
        warn!(path, %e, "websocket request rejected before dispatch");
        let _ = outbound.send(json_rpc_error_value(id, &e));
    }
}
