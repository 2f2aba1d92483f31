//! Wire types shared between the gateway service and its tests.
//!
//! Two independent wire formats meet at the gateway: the host-link protocol
//! (ETX-terminated JSON over a Unix socket, method-based RPC) and the
//! client-facing JSON-RPC 2.0 protocol used on `/websocket`. Both live here
//! so the gateway crate and its test utilities agree on one definition.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Host-link protocol
// ---------------------------------------------------------------------------

/// A request the gateway sends to the host.
///
/// `method` is the remote dispatch name the host registered via
/// `register_remote_method`, not the HTTP path.
#[derive(Debug, Clone, Serialize)]
pub struct HostRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// Anything the gateway can read off the host socket: a reply to a request
/// it sent, or a notification/registration call the host initiated.
///
/// The host protocol has no single discriminant tag; replies are
/// distinguished by the `is_response` marker. Deserializing into this loose
/// envelope first, then interpreting `method`/`is_response`, mirrors how the
/// host itself is permissive about field presence.
#[derive(Debug, Clone, Deserialize)]
pub struct HostEnvelope {
    pub id: Option<u64>,
    #[serde(default)]
    pub is_response: bool,
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    pub result: Option<Value>,
    pub error: Option<HostErrorPayload>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostErrorPayload {
    pub message: String,
}

/// `params` of a `register_remote_method` call.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRemoteMethod {
    pub endpoint: String,
    pub http_methods: Vec<String>,
    pub remote_method: String,
    #[serde(default)]
    pub request_timeout: Option<f64>,
}

/// `params` of a `process_filelist_change` notification.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilelistChangePayload {
    pub action: String,
    pub item: FileInfo,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileInfo {
    pub filename: String,
    pub size: u64,
    pub modified: f64,
}

/// Server-state values carried by `set_klippy_ready` / `_disconnect` /
/// `_shutdown`, and broadcast back out as `notify_klippy_state_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    Shutdown,
}

// ---------------------------------------------------------------------------
// Client-facing JSON-RPC 2.0 (the `/websocket` surface)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

pub mod jsonrpc_error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// A server-initiated notification (`notify_gcode_response`,
/// `notify_status_update`, `notify_filelist_changed`,
/// `notify_klippy_state_changed`). Notifications never carry an `id`, and
/// `params` is always a single-element array per the JSON-RPC baseline this
/// protocol follows.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: [Value; 1],
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, param: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params: [param],
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP error envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HttpErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResultBody<T> {
    pub result: T,
}

impl<T: Serialize> HttpResultBody<T> {
    pub fn new(result: T) -> Self {
        Self { result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_envelope_parses_reply() {
        let raw = r#"{"id":7,"is_response":true,"result":"ok"}"#;
        let env: HostEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.id, Some(7));
        assert!(env.is_response);
        assert_eq!(env.result.unwrap(), Value::String("ok".to_owned()));
    }

    #[test]
    fn host_envelope_parses_notification() {
        let raw = r#"{"method":"process_gcode_response","params":["Hello"]}"#;
        let env: HostEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.method.as_deref(), Some("process_gcode_response"));
        assert!(env.id.is_none());
        assert!(!env.is_response);
    }

    #[test]
    fn notification_params_is_single_element_array() {
        let note = JsonRpcNotification::new("notify_gcode_response", Value::String("hi".into()));
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["params"].as_array().unwrap().len(), 1);
    }
}
