//! HTTP/WebSocket surface: route registration and the dynamic
//! endpoint-to-multiplexer bridge.

pub mod access;
pub mod files;
pub mod machine;
pub mod subscriptions;
pub mod ws;

use std::net::{IpAddr, SocketAddr};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use gateway_protocol::{HttpErrorBody, HttpResultBody};

use crate::error::GatewayError;
use crate::multiplexer::ClientHandle;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/websocket", get(ws::handle_upgrade))
        .route(
            "/printer/subscriptions",
            get(subscriptions::get_subscriptions).post(subscriptions::post_subscriptions),
        )
        .route("/server/temperature_store", get(subscriptions::get_temperature_store))
        .route("/printer/files", get(files::list_files))
        .route("/printer/files/upload", axum::routing::post(files::upload_file))
        .route(
            "/printer/files/{filename}",
            get(files::download_file).delete(files::delete_file),
        )
        .route("/printer/klippy.log", get(files::get_klippy_log))
        .route("/server/moonraker.log", get(files::get_moonraker_log))
        .route(
            "/access/api_key",
            get(access::get_api_key).post(access::rotate_api_key),
        )
        .route("/access/oneshot_token", get(access::get_oneshot_token))
        .route("/machine/shutdown", axum::routing::post(machine::shutdown))
        .route("/machine/reboot", axum::routing::post(machine::reboot))
        .fallback(dynamic_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    if state.config.try_read().map(|c| c.enable_cors).unwrap_or(false) {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Every HTTP path the host registered via `register_remote_method` is
/// routed here: unmatched static routes fall through to a registry lookup
/// keyed by path + method, which forwards to the request multiplexer.
async fn dynamic_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    if let Err(e) = authenticate(&state, remote, &headers, &uri).await {
        return e.into_response();
    }

    let path = uri.path().to_owned();
    let registered = {
        let registry = state.registry.read().await;
        registry.get(&path).cloned()
    };
    let Some(info) = registered else {
        return GatewayError::NotFound(path).into_response();
    };
    if !info.http_methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str())) {
        return GatewayError::NotFound(format!("{method} {path}")).into_response();
    }

    let args = collect_args(&path, uri.query(), &body);

    let (tx, rx) = tokio::sync::oneshot::channel();
    if let Err(e) = state
        .multiplexer
        .submit(&path, args, ClientHandle::Http(tx))
        .await
    {
        return e.into_response();
    }

    match rx.await {
        Ok(Ok(result)) => (StatusCode::OK, axum::Json(HttpResultBody::new(result))).into_response(),
        Ok(Err(message)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(HttpErrorBody { error: message })).into_response()
        }
        Err(_) => GatewayError::Internal("multiplexer dropped the reply channel".to_owned()).into_response(),
    }
}

/// Build the `params` object sent to the host for a dynamically routed
/// request. `/printer/status` uses the object-name-as-query-key convention;
/// every other endpoint forwards a flat key/value map of its query
/// parameters, merged with a JSON body if any was sent.
fn collect_args(path: &str, query: Option<&str>, body: &Bytes) -> Value {
    let pairs: Vec<(String, Option<String>)> = query
        .map(|q| {
            q.split('&')
                .filter(|s| !s.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (decode_query_token(k), Some(decode_query_token(v))),
                    None => (decode_query_token(pair), None),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut args = if path == "/printer/status" {
        let mut objects = serde_json::Map::new();
        for (key, value) in pairs {
            let attrs: Vec<Value> = match value {
                Some(v) if !v.is_empty() => v.split(',').map(|a| Value::String(a.to_owned())).collect(),
                _ => Vec::new(),
            };
            objects.insert(key, Value::Array(attrs));
        }
        let mut top = serde_json::Map::new();
        top.insert("objects".to_owned(), Value::Object(objects));
        top
    } else {
        let mut map = serde_json::Map::new();
        for (key, value) in pairs {
            map.insert(key, Value::String(value.unwrap_or_default()));
        }
        map
    };

    if !body.is_empty() {
        if let Ok(Value::Object(body_map)) = serde_json::from_slice::<Value>(body) {
            for (k, v) in body_map {
                args.insert(k, v);
            }
        }
    }

    Value::Object(args)
}

/// Decode one `application/x-www-form-urlencoded` query token: `+` is a
/// literal space, and `%XX` escapes are decoded as whole UTF-8 byte
/// sequences (not byte-by-byte as `char`s, which would corrupt multi-byte
/// characters like `%C3%A9` -> `é`).
fn decode_query_token(s: &str) -> String {
    let with_spaces = s.replace('+', " ");
    urlencoding::decode(&with_spaces)
        .map(std::borrow::Cow::into_owned)
        .unwrap_or(with_spaces)
}

pub(crate) async fn authenticate(
    state: &AppState,
    remote: SocketAddr,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<(), GatewayError> {
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    let token = uri.query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(decode_query_token))
    });
    let addr = match remote.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    };
    state.auth.admit(addr, api_key, token.as_deref()).await
}

/// Same as `authenticate` but also reports whether admission was granted on
/// trust (subnet match / auth disabled) rather than key or token. Used by
/// the WebSocket upgrade handler to record trust for the connection's
/// lifetime, since `get_access_oneshot_token` must still enforce
/// trusted-only even over an already-authenticated socket.
pub(crate) async fn authenticate_with_trust(
    state: &AppState,
    remote: SocketAddr,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<bool, GatewayError> {
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    let token = uri.query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(decode_query_token))
    });
    let addr = match remote.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    };
    state.auth.admit_with_trust(addr, api_key, token.as_deref()).await
}

/// Trusted-client-only gate for `/access/oneshot_token`: an API key must not
/// be sufficient here, or a key holder could mint unlimited one-shot tokens.
pub(crate) async fn authenticate_trusted(
    state: &AppState,
    remote: SocketAddr,
    _headers: &HeaderMap,
    _uri: &Uri,
) -> Result<(), GatewayError> {
    let addr = match remote.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    };
    state.auth.admit_trusted(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_query_token_reassembles_multibyte_utf8() {
        assert_eq!(decode_query_token("caf%C3%A9"), "café");
    }

    #[test]
    fn decode_query_token_treats_plus_as_space() {
        assert_eq!(decode_query_token("RESPOND+MSG%3DHello"), "RESPOND MSG=Hello");
    }

    #[test]
    fn collect_args_decodes_gcode_script_without_corrupting_utf8() {
        let args = collect_args("/printer/gcode", Some("script=RESPOND MSG=caf%C3%A9"), &Bytes::new());
        assert_eq!(args["script"], "RESPOND MSG=café");
    }

    #[test]
    fn collect_args_decodes_status_object_and_attribute_names() {
        let args = collect_args("/printer/status", Some("toolhead=caf%C3%A9,target"), &Bytes::new());
        assert_eq!(
            args["objects"]["toolhead"],
            serde_json::json!(["café", "target"])
        );
    }
}
