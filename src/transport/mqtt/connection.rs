//! Connection configuration for broker sessions
//!
//! Pure functions for building `rumqttc` options, the last-will status payload
//! and the per-device topic namespace.

use crate::config::{CertificatePaths, MqttSection};
use crate::transport::ConnectionSpec;
use rumqttc::{LastWill, MqttOptions, QoS, Transport};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Keepalive interval for every broker connection
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// How long a new connection may take to receive its ConnAck
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state reported by a session's event loop
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected(String),
}

/// Broker transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("ConnAck timeout - no connection confirmation received within {0:?}")]
    ConnAckTimeout(Duration),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Unsubscribe failed: {0}")]
    UnsubscribeFailed(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Failed to read certificate {path}")]
    Certificate {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
}

/// PEM material loaded once and shared by every connection
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl TlsMaterial {
    pub fn load(paths: &CertificatePaths) -> Result<Self, MqttError> {
        Ok(Self {
            ca: read_pem(&paths.root_ca)?,
            cert: read_pem(&paths.cert)?,
            key: read_pem(&paths.private_key)?,
        })
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|source| MqttError::Certificate {
        path: path.display().to_string(),
        source,
    })
}

/// Broker address plus optional TLS material
#[derive(Debug, Clone)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsMaterial>,
}

impl BrokerEndpoint {
    /// Build from the `[mqtt]` section, loading certificates when TLS is enabled
    pub fn from_config(
        mqtt: &MqttSection,
        certs: Option<&CertificatePaths>,
    ) -> Result<Self, MqttError> {
        let tls = match (mqtt.tls, certs) {
            (true, Some(paths)) => Some(TlsMaterial::load(paths)?),
            (true, None) => {
                return Err(MqttError::ConnectionFailed(
                    "TLS enabled without certificate paths".to_string(),
                ))
            }
            (false, _) => None,
        };

        Ok(Self {
            host: mqtt.endpoint.clone(),
            port: mqtt.port,
            tls,
        })
    }
}

/// Retained status published by the broker when a connection drops uncleanly
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WillPayload {
    pub status: &'static str,
    pub timestamp: String,
    pub client_id: String,
    pub device_id: String,
}

impl WillPayload {
    pub fn disconnected(spec: &ConnectionSpec) -> Self {
        Self {
            status: "disconnected",
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            client_id: spec.connection_id.clone(),
            device_id: spec.device_id.clone(),
        }
    }
}

/// Build `rumqttc` options for one connection
pub fn configure_mqtt_options(
    endpoint: &BrokerEndpoint,
    spec: &ConnectionSpec,
) -> Result<MqttOptions, MqttError> {
    let mut options = MqttOptions::new(&spec.connection_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);

    if let Some(tls) = &endpoint.tls {
        options.set_transport(Transport::tls(
            tls.ca.clone(),
            Some((tls.cert.clone(), tls.key.clone())),
            None,
        ));
    }

    let will = serde_json::to_vec(&WillPayload::disconnected(spec))
        .map_err(MqttError::Serialization)?;
    options.set_last_will(LastWill::new(
        TopicBuilder::connection(&spec.thing_name),
        will,
        QoS::AtLeastOnce,
        true,
    ));

    Ok(options)
}

/// Per-device topic namespace, everything lives under `<thing_name>/`
pub struct TopicBuilder;

impl TopicBuilder {
    /// Discovery channel: `<thing_name>/topics`
    pub fn topics(thing_name: &str) -> String {
        format!("{thing_name}/topics")
    }

    /// Control plane: `<thing_name>/sub`
    pub fn sub(thing_name: &str) -> String {
        format!("{thing_name}/sub")
    }

    /// Last-will status: `<thing_name>/connection`
    pub fn connection(thing_name: &str) -> String {
        format!("{thing_name}/connection")
    }

    /// Prefix a device-local topic with the thing name
    pub fn device_topic(thing_name: &str, topic: &str) -> String {
        format!("{thing_name}/{topic}")
    }

    /// Strip a leading `<thing_name>/`, leaving other topics untouched
    pub fn strip_thing_prefix<'a>(thing_name: &str, topic: &'a str) -> &'a str {
        topic
            .strip_prefix(thing_name)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(topic)
    }
}
