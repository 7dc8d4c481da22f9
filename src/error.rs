//! Error taxonomy for the telemetry bridge
//!
//! Every fallible operation in the core resolves to [`BridgeError`]. The HTTP
//! control surface maps each variant to a status code and renders it with the
//! shared `{error, message, timestamp, details?}` shape.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("static regex is valid")
});

static KEY_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|certs?|\.ssh|\.aws)/[a-zA-Z0-9._/-]+")
        .expect("static regex is valid")
});

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Topic discovery timeout with no topics discovered for device {device_id}")]
    DiscoveryTimeout { device_id: String },

    #[error("Sink delivery failed: {0}")]
    SinkDelivery(#[from] crate::stream::sink::SinkError),

    #[error("Failed to send command: {message}")]
    Command { message: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Device {device_id} not found")]
    DeviceNotFound { device_id: String },

    #[error("Device {device_id} not connected")]
    DeviceNotReady { device_id: String },

    #[error("Device {device_id} not connected")]
    NotConnected { device_id: String },

    #[error("MQTT error: {0}")]
    Mqtt(#[from] crate::transport::mqtt::MqttError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn command<S: Into<String>>(message: S) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn device_not_found<S: Into<String>>(device_id: S) -> Self {
        Self::DeviceNotFound {
            device_id: device_id.into(),
        }
    }

    pub fn device_not_ready<S: Into<String>>(device_id: S) -> Self {
        Self::DeviceNotReady {
            device_id: device_id.into(),
        }
    }

    pub fn not_connected<S: Into<String>>(device_id: S) -> Self {
        Self::NotConnected {
            device_id: device_id.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code the control surface answers with for this error
    pub fn status_code(&self) -> u16 {
        match self {
            BridgeError::Validation { .. } | BridgeError::Command { .. } => 400,
            BridgeError::DeviceNotFound { .. } => 404,
            BridgeError::DeviceNotReady { .. } | BridgeError::NotConnected { .. } => 409,
            _ => 500,
        }
    }

    /// Error message safe to hand back to an HTTP caller
    pub fn public_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Redact credentials and key material paths, and cap the message length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = KEY_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
