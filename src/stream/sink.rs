//! Delivery of formatted batches to the ingestion sink

use super::formatter::StreamBatchPayload;
use crate::config::StreamParameters;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Per-request timeout for sink deliveries
pub const SINK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP {status}: Unexpected response status: {status}")]
    UnexpectedStatus { status: u16 },
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Invalid sink configuration: {0}")]
    InvalidConfig(String),
}

/// Receives every batch a stream manager flushes
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Deliver a batch, returning the accepted status code
    async fn send(&self, payload: &StreamBatchPayload) -> Result<u16, SinkError>;
}

/// JSON-over-HTTP sink
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    method: reqwest::Method,
    headers: HashMap<String, String>,
    timeout: Duration,
}

impl HttpSink {
    pub fn new(parameters: &StreamParameters) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SinkError::InvalidConfig(e.to_string()))?;
        Self::with_client(client, parameters)
    }

    pub fn with_client(
        client: reqwest::Client,
        parameters: &StreamParameters,
    ) -> Result<Self, SinkError> {
        let method = parse_method(&parameters.method)?;
        Ok(Self {
            client,
            endpoint: parameters.endpoint.clone(),
            method,
            headers: parameters.headers.clone(),
            timeout: SINK_TIMEOUT,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn parse_method(method: &str) -> Result<reqwest::Method, SinkError> {
    match method.to_uppercase().as_str() {
        "POST" => Ok(reqwest::Method::POST),
        "PUT" => Ok(reqwest::Method::PUT),
        "PATCH" => Ok(reqwest::Method::PATCH),
        other => Err(SinkError::InvalidConfig(format!(
            "unsupported sink method '{other}'"
        ))),
    }
}

/// 200 and 202 are the only accepted answers
pub fn is_accepted(status: u16) -> bool {
    status == 200 || status == 202
}

#[async_trait]
impl BatchSink for HttpSink {
    async fn send(&self, payload: &StreamBatchPayload) -> Result<u16, SinkError> {
        let mut request = self
            .client
            .request(self.method.clone(), &self.endpoint)
            .timeout(self.timeout)
            .json(payload);

        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            SinkError::Request(match e.status() {
                Some(status) => format!("HTTP {}: {e}", status.as_u16()),
                None => format!("HTTP undefined: {e}"),
            })
        })?;

        let status = response.status().as_u16();
        if is_accepted(status) {
            Ok(status)
        } else {
            Err(SinkError::UnexpectedStatus { status })
        }
    }
}
