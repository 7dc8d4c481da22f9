//! Shared JSON error shape of the control API

use crate::error::BridgeError;
use crate::stream::formatter::now_iso;
use serde::Serialize;
use serde_json::Value;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Reply;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Reason phrase used in the `error` field
pub fn error_type(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        422 => "Validation Error",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

pub fn error_reply(status: u16, message: impl Into<String>, details: Option<Value>) -> Response {
    let body = ErrorResponse {
        error: error_type(status).to_string(),
        message: message.into(),
        timestamp: now_iso(),
        details,
    };
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    warp::reply::with_status(warp::reply::json(&body), code).into_response()
}

/// Render a bridge error with its mapped status and a sanitized message
pub fn bridge_error_reply(error: &BridgeError) -> Response {
    let status = error.status_code();
    if status >= 500 {
        tracing::error!(error = %error, status, "API error occurred");
    } else {
        tracing::warn!(error = %error, status, "API request rejected");
    }
    error_reply(status, error.public_message(), None)
}

pub fn not_found(message: impl Into<String>) -> Response {
    error_reply(404, message, None)
}
