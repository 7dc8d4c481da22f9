//! MQTT 3.1.1 broker transport on `rumqttc`
//!
//! - [`connection`] - option building, last will, topic namespace
//! - [`message_handler`] - pure event routing and SubAck correlation
//! - [`client`] - session I/O and the event loop task
//!
//! # Usage
//!
//! ```rust,no_run
//! use telemetry_bridge::config::MqttSection;
//! use telemetry_bridge::transport::mqtt::{BrokerEndpoint, MqttConnector};
//! use telemetry_bridge::transport::{BrokerConnector, ConnectionSpec};
//!
//! # tokio_test::block_on(async {
//! let mqtt = MqttSection {
//!     endpoint: "localhost".to_string(),
//!     port: 1883,
//!     tls: false,
//! };
//! let connector = MqttConnector::new(BrokerEndpoint::from_config(&mqtt, None)?);
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let session = connector
//!     .connect(ConnectionSpec::discovery("dev-1", "thing-1"), tx)
//!     .await?;
//! session.subscribe("thing-1/topics").await?;
//! let announcement = rx.recv().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnector, MqttSession};
pub use connection::{BrokerEndpoint, ConnectionState, MqttError, TlsMaterial, TopicBuilder};
pub use message_handler::{EventRoute, SubAckTracker};
