//! Broker transport seam
//!
//! The connection pool talks to the broker only through [`BrokerConnector`] and
//! [`BrokerSession`]. [`mqtt::MqttConnector`] is the production implementation;
//! tests plug in the in-memory connector from [`crate::testing::mocks`].

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod mqtt;

pub use mqtt::MqttError;

/// SubAck return code a broker uses to reject a subscription
pub const SUBACK_FAILURE: u8 = 0x80;

/// Role a broker connection plays for its device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Discovery,
    Data { index: usize },
}

/// Everything needed to open one broker connection on behalf of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    /// Unique id, also used as the MQTT client id
    pub connection_id: String,
    pub device_id: String,
    pub thing_name: String,
    pub role: ConnectionRole,
}

impl ConnectionSpec {
    /// `<device_id>-discovery-<8 hex>`
    pub fn discovery(device_id: &str, thing_name: &str) -> Self {
        Self {
            connection_id: format!("{device_id}-discovery-{}", short_id()),
            device_id: device_id.to_string(),
            thing_name: thing_name.to_string(),
            role: ConnectionRole::Discovery,
        }
    }

    /// `<device_id>-data-<index>-<8 hex>`
    pub fn data(device_id: &str, thing_name: &str, index: usize) -> Self {
        Self {
            connection_id: format!("{device_id}-data-{index}-{}", short_id()),
            device_id: device_id.to_string(),
            thing_name: thing_name.to_string(),
            role: ConnectionRole::Data { index },
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// A publish received on one of the pool's connections
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub connection_id: String,
    pub device_id: String,
    pub thing_name: String,
    /// Full broker topic, including the thing name prefix
    pub topic: String,
    pub payload: Bytes,
}

pub type InboundSender = mpsc::UnboundedSender<InboundMessage>;
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundMessage>;

/// One live broker connection
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn connection_id(&self) -> &str;

    /// Subscribe at QoS 1 and return the granted QoS from the SubAck.
    /// A rejection is reported as [`SUBACK_FAILURE`], not as an error.
    async fn subscribe(&self, topic: &str) -> Result<u8, MqttError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;

    /// Publish at QoS 1 without the retain flag
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), MqttError>;
}

/// Opens broker connections
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect and wait for the broker to acknowledge. Every publish received on
    /// the new connection is forwarded to `inbound` in arrival order.
    async fn connect(
        &self,
        spec: ConnectionSpec,
        inbound: InboundSender,
    ) -> Result<Arc<dyn BrokerSession>, MqttError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique_and_prefixed() {
        let a = ConnectionSpec::discovery("dev-1", "thing-1");
        let b = ConnectionSpec::discovery("dev-1", "thing-1");
        assert!(a.connection_id.starts_with("dev-1-discovery-"));
        assert_eq!(a.connection_id.len(), "dev-1-discovery-".len() + 8);
        assert_ne!(a.connection_id, b.connection_id);

        let data = ConnectionSpec::data("dev-1", "thing-1", 2);
        assert!(data.connection_id.starts_with("dev-1-data-2-"));
        assert_eq!(data.role, ConnectionRole::Data { index: 2 });
    }
}
