use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gateway_protocol::{HttpErrorBody, jsonrpc_error_codes};
use serde_json::Value;
use thiserror::Error;

/// The gateway's single error type. Both the HTTP and the JSON-RPC surface
/// format their responses from this enum so the two never drift apart.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("request timed out")]
    Timeout,
    #[error("host disconnected")]
    HostDisconnected,
    #[error("host error: {0}")]
    HostError(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Timeout
            | GatewayError::HostDisconnected
            | GatewayError::HostError(_)
            | GatewayError::Internal(_)
            | GatewayError::Io(_)
            | GatewayError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map this error onto a JSON-RPC error object for the `id` it answers.
    pub fn to_json_rpc_error(&self) -> (i64, String) {
        let code = match self {
            GatewayError::NotFound(_) => jsonrpc_error_codes::METHOD_NOT_FOUND,
            GatewayError::BadRequest(_) => jsonrpc_error_codes::INVALID_PARAMS,
            _ => jsonrpc_error_codes::INTERNAL_ERROR,
        };
        (code, self.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = HttpErrorBody {
            error: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Build the JSON-RPC error value for a given request id.
pub fn json_rpc_error_value(id: Value, err: &GatewayError) -> Value {
    let (code, message) = err.to_json_rpc_error();
    serde_json::json!({
        "jsonrpc": "2.0",
        "error": {"code": code, "message": message},
        "id": id,
    })
}
