//! Mock implementations for testing
//!
//! [`MockConnector`] is an in-memory broker: it records every connection,
//! subscription and publish, can replay retained payloads on subscribe, and can
//! be told to refuse connections or reject subscriptions. [`RecordingSink`]
//! captures delivered batches and can fail a configurable number of times.

use crate::stream::formatter::StreamBatchPayload;
use crate::stream::sink::{BatchSink, SinkError};
use crate::transport::{
    BrokerConnector, BrokerSession, ConnectionRole, ConnectionSpec, InboundMessage, InboundSender,
    MqttError, SUBACK_FAILURE,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub type PublishedMessage = (String, Vec<u8>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct BrokerState {
    sessions: Vec<Arc<MockSession>>,
    retained: HashMap<String, String>,
    rejected_topics: HashSet<String>,
    connect_failures: HashMap<String, usize>,
    connect_attempts: usize,
}

/// In-memory broker connector
#[derive(Clone, Default)]
pub struct MockConnector {
    broker: Arc<Mutex<BrokerState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `payload` to every future subscriber of `topic`, like a retained message
    pub fn retain(&self, topic: &str, payload: &str) {
        lock(&self.broker)
            .retained
            .insert(topic.to_string(), payload.to_string());
    }

    /// Answer subscriptions to `topic` with a 0x80 SubAck
    pub fn reject_subscription(&self, topic: &str) {
        lock(&self.broker).rejected_topics.insert(topic.to_string());
    }

    /// Refuse the next `count` connection attempts for `device_id`
    pub fn fail_connects(&self, device_id: &str, count: usize) {
        lock(&self.broker)
            .connect_failures
            .insert(device_id.to_string(), count);
    }

    pub fn connect_attempts(&self) -> usize {
        lock(&self.broker).connect_attempts
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        lock(&self.broker).sessions.clone()
    }

    pub fn sessions_for(&self, device_id: &str) -> Vec<Arc<MockSession>> {
        self.sessions()
            .into_iter()
            .filter(|s| s.spec.device_id == device_id)
            .collect()
    }

    /// Data connections of a device, in the order they were opened
    pub fn data_sessions_for(&self, device_id: &str) -> Vec<Arc<MockSession>> {
        self.sessions_for(device_id)
            .into_iter()
            .filter(|s| matches!(s.spec.role, ConnectionRole::Data { .. }))
            .collect()
    }

    /// Every publish made on any connection, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.sessions()
            .iter()
            .flat_map(|s| s.published())
            .collect()
    }

    /// Send a publish from the broker to the first connected session subscribed to `topic`
    pub fn deliver(&self, topic: &str, payload: &str) -> bool {
        let target = self
            .sessions()
            .into_iter()
            .find(|s| s.is_connected() && s.subscriptions().iter().any(|t| t == topic));
        match target {
            Some(session) => session.inject(topic, payload),
            None => false,
        }
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    async fn connect(
        &self,
        spec: ConnectionSpec,
        inbound: InboundSender,
    ) -> Result<Arc<dyn BrokerSession>, MqttError> {
        let mut broker = lock(&self.broker);
        broker.connect_attempts += 1;

        if let Some(remaining) = broker.connect_failures.get_mut(&spec.device_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MqttError::ConnectionFailed(format!(
                    "mock broker refused {}",
                    spec.connection_id
                )));
            }
        }

        let session = Arc::new(MockSession {
            spec,
            inbound,
            broker: self.broker.clone(),
            connected: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        });
        broker.sessions.push(session.clone());
        Ok(session)
    }
}

/// One in-memory broker connection
pub struct MockSession {
    pub spec: ConnectionSpec,
    inbound: InboundSender,
    broker: Arc<Mutex<BrokerState>>,
    connected: AtomicBool,
    subscriptions: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
}

impl MockSession {
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        lock(&self.unsubscribed).clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    /// Simulate a dropped or restored broker link
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Push an inbound publish through this connection
    pub fn inject(&self, topic: &str, payload: &str) -> bool {
        self.inbound
            .send(InboundMessage {
                connection_id: self.spec.connection_id.clone(),
                device_id: self.spec.device_id.clone(),
                thing_name: self.spec.thing_name.clone(),
                topic: topic.to_string(),
                payload: Bytes::from(payload.to_string()),
            })
            .is_ok()
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    fn connection_id(&self) -> &str {
        &self.spec.connection_id
    }

    async fn subscribe(&self, topic: &str) -> Result<u8, MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }

        let (rejected, retained) = {
            let broker = lock(&self.broker);
            (
                broker.rejected_topics.contains(topic),
                broker.retained.get(topic).cloned(),
            )
        };
        if rejected {
            return Ok(SUBACK_FAILURE);
        }

        lock(&self.subscriptions).push(topic.to_string());
        if let Some(payload) = retained {
            self.inject(topic, &payload);
        }
        Ok(1)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        lock(&self.subscriptions).retain(|t| t != topic);
        lock(&self.unsubscribed).push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        lock(&self.published).push((topic.to_string(), payload));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.set_connected(false);
        Ok(())
    }
}

/// Sink that records every batch it accepts
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<StreamBatchPayload>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `count` deliveries with a 500
    pub fn failing(count: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(count),
            ..Self::default()
        }
    }

    /// Hold every delivery for `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn batches(&self) -> Vec<StreamBatchPayload> {
        lock(&self.batches).clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchSink for RecordingSink {
    async fn send(&self, payload: &StreamBatchPayload) -> Result<u16, SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SinkError::UnexpectedStatus { status: 500 });
        }

        lock(&self.batches).push(payload.clone());
        Ok(200)
    }
}
