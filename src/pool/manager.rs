//! Multi-device connection pool
//!
//! Each device gets one discovery connection subscribed to `<thing>/topics`.
//! Once the device announces its topic set, the topics are split into chunks of
//! at most [`MAX_TOPICS_PER_CONNECTION`] and every chunk gets its own data
//! connection. Inbound data publishes from all connections funnel through one
//! channel into the [`MessageBus`].

use super::allocator::{chunk_topics, MAX_TOPICS_PER_CONNECTION};
use super::discovery::{parse_discovery_payload, TopicDiscovery};
use crate::bus::{HandlerId, MessageBus, MessageHandler};
use crate::config::DeviceConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::health::{
    DeviceHealthMonitor, DeviceHealthStatus, DeviceInitializer, HealthSummary, RetryPolicy,
};
use crate::transport::mqtt::TopicBuilder;
use crate::transport::{
    BrokerConnector, BrokerSession, ConnectionSpec, InboundMessage, InboundSender, SUBACK_FAILURE,
};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Timing knobs of the pool
#[derive(Debug, Clone)]
pub struct PoolTiming {
    /// Delay between the starts of consecutive device initializations
    pub stagger: Duration,
    pub init_poll: Duration,
    /// Overall wait for every device's discovery in [`ConnectionPoolManager::initialize`]
    pub init_timeout: Duration,
    pub discovery_poll: Duration,
    pub discovery_timeout: Duration,
    /// Pause between opening consecutive data connections of one device
    pub chunk_delay: Duration,
    pub max_topics_per_connection: usize,
}

impl Default for PoolTiming {
    fn default() -> Self {
        Self {
            stagger: Duration::from_millis(2000),
            init_poll: Duration::from_millis(500),
            init_timeout: Duration::from_secs(60),
            discovery_poll: Duration::from_millis(100),
            discovery_timeout: Duration::from_secs(30),
            chunk_delay: Duration::from_millis(200),
            max_topics_per_connection: MAX_TOPICS_PER_CONNECTION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolDeviceStatus {
    Discovering,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub thing_name: String,
    pub connections: usize,
    pub topics_discovered: usize,
    pub topics_subscribed: usize,
    pub messages_received: u64,
    pub status: PoolDeviceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_devices: usize,
    pub total_connections: usize,
    pub connected_connections: usize,
    pub devices_ready: usize,
    pub total_topics_discovered: usize,
    pub total_messages_received: u64,
    pub devices: BTreeMap<String, DeviceStats>,
}

struct ConnectionInfo {
    session: Arc<dyn BrokerSession>,
    device_id: String,
    subscribed_topics: Vec<String>,
    messages_received: u64,
}

#[derive(Default)]
struct PoolState {
    device_order: Vec<String>,
    devices: HashMap<String, DeviceConfig>,
    discovery: HashMap<String, TopicDiscovery>,
    connections: HashMap<String, ConnectionInfo>,
    device_connections: HashMap<String, Vec<String>>,
}

impl PoolState {
    fn add_device(&mut self, config: &DeviceConfig) {
        if !self.devices.contains_key(&config.device_id) {
            self.device_order.push(config.device_id.clone());
        }
        self.devices
            .insert(config.device_id.clone(), config.clone());
        self.discovery
            .entry(config.device_id.clone())
            .or_insert_with(|| TopicDiscovery::new(&config.thing_name));
    }

    fn insert_connection(&mut self, connection_id: &str, info: ConnectionInfo) {
        self.device_connections
            .entry(info.device_id.clone())
            .or_default()
            .push(connection_id.to_string());
        self.connections.insert(connection_id.to_string(), info);
    }

    fn remove_device_connections(&mut self, device_id: &str) -> Vec<Arc<dyn BrokerSession>> {
        self.device_connections
            .remove(device_id)
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.connections.remove(id))
            .map(|info| info.session)
            .collect()
    }

    fn discovery_complete(&self, device_id: &str) -> bool {
        self.discovery
            .get(device_id)
            .map(|d| d.complete)
            .unwrap_or(false)
    }
}

pub struct ConnectionPoolManager {
    connector: Arc<dyn BrokerConnector>,
    bus: Arc<MessageBus>,
    health: Arc<DeviceHealthMonitor>,
    timing: PoolTiming,
    state: Mutex<PoolState>,
    inbound_tx: InboundSender,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    init_tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionPoolManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        bus: Arc<MessageBus>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        Self::with_timing(connector, bus, policy, PoolTiming::default())
    }

    pub fn with_timing(
        connector: Arc<dyn BrokerConnector>,
        bus: Arc<MessageBus>,
        policy: RetryPolicy,
        timing: PoolTiming,
    ) -> Arc<Self> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
        let health = DeviceHealthMonitor::new(policy);

        let manager = Arc::new(Self {
            connector,
            bus,
            health,
            timing,
            state: Mutex::new(PoolState::default()),
            inbound_tx,
            dispatch_task: Mutex::new(None),
            init_tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let initializer: Arc<dyn DeviceInitializer> = manager.clone();
        manager.health.set_initializer(Arc::downgrade(&initializer));

        let weak: Weak<Self> = Arc::downgrade(&manager);
        let dispatch = tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                match weak.upgrade() {
                    Some(manager) => manager.handle_inbound(message),
                    None => break,
                }
            }
        });
        *lock(&manager.dispatch_task) = Some(dispatch);

        manager
    }

    pub fn health_monitor(&self) -> &Arc<DeviceHealthMonitor> {
        &self.health
    }

    /// Register every device, start staggered initialization and wait for discovery
    pub async fn initialize(self: &Arc<Self>, devices: &[DeviceConfig]) -> BridgeResult<()> {
        info!(device_count = devices.len(), "Initializing multi-device MQTT client");

        {
            let mut state = lock(&self.state);
            for device in devices {
                state.add_device(device);
            }
        }
        for device in devices {
            self.health.register_device(device);
        }

        for (index, device) in devices.iter().enumerate() {
            let delay = self.timing.stagger.saturating_mul(index as u32);
            let manager = Arc::downgrade(self);
            let config = device.clone();
            let span = crate::device_span!(device_id = %config.device_id, thing_name = %config.thing_name);

            let task = tokio::spawn(
                async move {
                    tokio::time::sleep(delay).await;
                    let Some(manager) = manager.upgrade() else {
                        return;
                    };
                    match manager.initialize_device(&config).await {
                        Ok(()) => manager.health.mark_device_ready(&config.device_id),
                        Err(e) => manager
                            .health
                            .mark_device_failed(&config.device_id, &e.to_string()),
                    }
                }
                .instrument(span),
            );
            lock(&self.init_tasks).push(task);
        }

        self.wait_for_initialization(devices.len()).await;
        self.health.start_health_checks();

        let stats = self.get_stats();
        info!(
            total_devices = stats.total_devices,
            devices_ready = stats.devices_ready,
            total_connections = stats.total_connections,
            "Multi-device MQTT client initialized"
        );
        Ok(())
    }

    async fn wait_for_initialization(&self, expected: usize) {
        let deadline = Instant::now() + self.timing.init_timeout;
        loop {
            let complete = {
                let state = lock(&self.state);
                state
                    .device_order
                    .iter()
                    .filter(|id| state.discovery_complete(id))
                    .count()
            };

            if complete >= expected {
                info!(devices_complete = complete, "All devices completed topic discovery");
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    devices_complete = complete,
                    devices_expected = expected,
                    "Initialization wait timed out, continuing with partial discovery"
                );
                return;
            }
            tokio::time::sleep(self.timing.init_poll).await;
        }
    }

    /// Open the discovery connection, wait for the topic set and build the data pool
    pub async fn initialize_device(&self, config: &DeviceConfig) -> BridgeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::internal("Connection pool is shut down"));
        }

        info!(
            device_id = %config.device_id,
            thing_name = %config.thing_name,
            mode = ?config.topics.mode,
            "Initializing device"
        );

        let stale = {
            let mut state = lock(&self.state);
            state.add_device(config);
            state.remove_device_connections(&config.device_id)
        };
        if !stale.is_empty() {
            debug!(
                device_id = %config.device_id,
                connections = stale.len(),
                "Closing connections from previous attempt"
            );
            close_sessions(stale).await;
        }

        let discovery = self.open_discovery_connection(config).await?;
        let topics = self.wait_for_discovery(&config.device_id).await?;
        info!(
            device_id = %config.device_id,
            count = topics.len(),
            sample = ?topics.iter().take(5).collect::<Vec<_>>(),
            "Topics discovered"
        );

        let discovery_topic = TopicBuilder::topics(&config.thing_name);
        match discovery.unsubscribe(&discovery_topic).await {
            Ok(()) => {
                if let Some(info) = lock(&self.state).connections.get_mut(discovery.connection_id()) {
                    info.subscribed_topics.retain(|t| t != &discovery_topic);
                }
            }
            Err(e) => warn!(
                device_id = %config.device_id,
                error = %e,
                "Failed to unsubscribe from discovery topic"
            ),
        }

        self.build_pool(config, &topics).await?;

        info!(
            device_id = %config.device_id,
            connections = lock(&self.state)
                .device_connections
                .get(&config.device_id)
                .map(Vec::len)
                .unwrap_or(0),
            topics = topics.len(),
            "Device initialization complete"
        );
        Ok(())
    }

    async fn open_discovery_connection(
        &self,
        config: &DeviceConfig,
    ) -> BridgeResult<Arc<dyn BrokerSession>> {
        let spec = ConnectionSpec::discovery(&config.device_id, &config.thing_name);
        let connection_id = spec.connection_id.clone();

        let session = self
            .connector
            .connect(spec, self.inbound_tx.clone())
            .await
            .map_err(|e| {
                BridgeError::connection(format!(
                    "Discovery connection failed for device {}: {e}",
                    config.device_id
                ))
            })?;
        info!(device_id = %config.device_id, connection_id, "Discovery connection established");

        lock(&self.state).insert_connection(
            &connection_id,
            ConnectionInfo {
                session: session.clone(),
                device_id: config.device_id.clone(),
                subscribed_topics: Vec::new(),
                messages_received: 0,
            },
        );

        let topic = TopicBuilder::topics(&config.thing_name);
        let granted = session.subscribe(&topic).await.map_err(|e| {
            BridgeError::connection(format!("Failed to subscribe to {topic}: {e}"))
        })?;
        if granted == SUBACK_FAILURE {
            return Err(BridgeError::connection(format!(
                "Subscription to {topic} rejected by broker"
            )));
        }

        if let Some(info) = lock(&self.state).connections.get_mut(&connection_id) {
            info.subscribed_topics.push(topic.clone());
        }
        info!(device_id = %config.device_id, topic, "Subscribed to topic discovery");

        Ok(session)
    }

    async fn wait_for_discovery(&self, device_id: &str) -> BridgeResult<Vec<String>> {
        let deadline = Instant::now() + self.timing.discovery_timeout;
        loop {
            let topics = lock(&self.state)
                .discovery
                .get(device_id)
                .map(|d| (d.complete, d.topics.clone()));

            match topics {
                Some((true, topics)) if !topics.is_empty() => return Ok(topics),
                Some((_, topics)) if Instant::now() >= deadline => {
                    if topics.is_empty() {
                        return Err(BridgeError::DiscoveryTimeout {
                            device_id: device_id.to_string(),
                        });
                    }
                    warn!(
                        device_id,
                        topic_count = topics.len(),
                        "Discovery timed out, using partially discovered topics"
                    );
                    return Ok(topics);
                }
                None => return Err(BridgeError::device_not_found(device_id)),
                _ => tokio::time::sleep(self.timing.discovery_poll).await,
            }
        }
    }

    async fn build_pool(&self, config: &DeviceConfig, topics: &[String]) -> BridgeResult<()> {
        let chunks = chunk_topics(topics, self.timing.max_topics_per_connection);
        info!(
            device_id = %config.device_id,
            total_topics = topics.len(),
            connections_needed = chunks.len(),
            "Creating connection pool"
        );

        let mut established = 0usize;
        for (index, chunk) in chunks.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.timing.chunk_delay).await;
            }
            match self.open_data_connection(config, index, chunk).await {
                Ok(subscribed) => {
                    established += 1;
                    info!(
                        device_id = %config.device_id,
                        connection_index = index,
                        subscribed,
                        requested = chunk.len(),
                        "Data connection ready"
                    );
                }
                Err(e) => error!(
                    device_id = %config.device_id,
                    connection_index = index,
                    error = %e,
                    "Failed to create data connection"
                ),
            }
        }

        if established == 0 && !chunks.is_empty() {
            return Err(BridgeError::connection(format!(
                "No data connections could be established for device {}",
                config.device_id
            )));
        }
        Ok(())
    }

    async fn open_data_connection(
        &self,
        config: &DeviceConfig,
        index: usize,
        chunk: &[String],
    ) -> BridgeResult<usize> {
        let spec = ConnectionSpec::data(&config.device_id, &config.thing_name, index);
        let connection_id = spec.connection_id.clone();
        let session = self
            .connector
            .connect(spec, self.inbound_tx.clone())
            .await
            .map_err(|e| BridgeError::connection(e.to_string()))?;

        let attempts = chunk.iter().map(|topic| {
            let session = session.clone();
            let full = TopicBuilder::device_topic(&config.thing_name, topic);
            async move {
                let outcome = session.subscribe(&full).await;
                (full, outcome)
            }
        });

        let mut subscribed = Vec::with_capacity(chunk.len());
        for (topic, outcome) in join_all(attempts).await {
            match outcome {
                Ok(granted) if granted != SUBACK_FAILURE => subscribed.push(topic),
                Ok(_) => warn!(connection_id, topic, "Subscription rejected by broker"),
                Err(e) => warn!(connection_id, topic, error = %e, "Subscription failed"),
            }
        }

        if subscribed.is_empty() {
            if let Err(e) = session.disconnect().await {
                debug!(connection_id, error = %e, "Disconnect after failed subscriptions");
            }
            return Err(BridgeError::connection("All topic subscriptions failed"));
        }

        let count = subscribed.len();
        lock(&self.state).insert_connection(
            &connection_id,
            ConnectionInfo {
                session: session.clone(),
                device_id: config.device_id.clone(),
                subscribed_topics: subscribed,
                messages_received: 0,
            },
        );

        let add_topics = json!({"type": "AddTopics", "topic_names": chunk});
        let sub_topic = TopicBuilder::sub(&config.thing_name);
        match session.publish(&sub_topic, add_topics.to_string().into_bytes()).await {
            Ok(()) => info!(connection_id, topic_count = chunk.len(), "AddTopics sent"),
            Err(e) => warn!(connection_id, error = %e, "Failed to send AddTopics"),
        }

        Ok(count)
    }

    /// Route one inbound publish: discovery announcements or data fan-out
    pub fn handle_inbound(&self, message: InboundMessage) {
        let payload = String::from_utf8_lossy(&message.payload);

        if message.topic == TopicBuilder::topics(&message.thing_name) {
            self.handle_discovery(&message.device_id, &payload);
            return;
        }

        if let Some(info) = lock(&self.state).connections.get_mut(&message.connection_id) {
            info.messages_received += 1;
        }

        let topic = TopicBuilder::strip_thing_prefix(&message.thing_name, &message.topic);
        self.bus.dispatch(&message.device_id, topic, &payload);
    }

    fn handle_discovery(&self, device_id: &str, payload: &str) {
        let mut state = lock(&self.state);
        let Some(discovery) = state.discovery.get_mut(device_id) else {
            return;
        };
        if discovery.complete {
            return;
        }

        let topics = match parse_discovery_payload(payload) {
            Ok(topics) => topics,
            Err(e) => {
                error!(device_id, error = %e, "Failed to parse topic discovery payload");
                return;
            }
        };
        if topics.is_empty() {
            warn!(device_id, "No topics found in discovery message");
            return;
        }

        let count = topics.len();
        discovery.record(topics);
        info!(device_id, topic_count = count, "Topic discovery complete");
    }

    /// Publish on the device's first connection, under its thing-name prefix
    pub async fn publish(&self, device_id: &str, topic: &str, payload: Vec<u8>) -> BridgeResult<()> {
        let target = {
            let state = lock(&self.state);
            let thing_name = state.devices.get(device_id).map(|d| d.thing_name.clone());
            let session = state
                .device_connections
                .get(device_id)
                .and_then(|ids| ids.first())
                .and_then(|id| state.connections.get(id))
                .map(|info| info.session.clone());
            thing_name.zip(session)
        };

        let Some((thing_name, session)) = target else {
            warn!(device_id, "No connections found for device");
            return Err(BridgeError::not_connected(device_id));
        };
        if !session.is_connected() {
            return Err(BridgeError::not_connected(device_id));
        }

        let full = TopicBuilder::device_topic(&thing_name, topic);
        session.publish(&full, payload).await?;
        debug!(device_id, topic = %full, "Message published");
        Ok(())
    }

    pub fn get_stats(&self) -> PoolStats {
        let state = lock(&self.state);
        let mut stats = PoolStats {
            total_devices: state.devices.len(),
            total_connections: state.connections.len(),
            ..PoolStats::default()
        };

        for info in state.connections.values() {
            if info.session.is_connected() {
                stats.connected_connections += 1;
            }
            stats.total_messages_received += info.messages_received;
        }

        for device_id in &state.device_order {
            let Some(config) = state.devices.get(device_id) else {
                continue;
            };
            let discovery = state.discovery.get(device_id);
            let ids = state
                .device_connections
                .get(device_id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let connections: Vec<&ConnectionInfo> =
                ids.iter().filter_map(|id| state.connections.get(id)).collect();

            let status = match discovery {
                Some(d) if d.complete => PoolDeviceStatus::Ready,
                Some(_) => PoolDeviceStatus::Discovering,
                None => PoolDeviceStatus::Error,
            };
            if status == PoolDeviceStatus::Ready {
                stats.devices_ready += 1;
            }
            let topics_discovered = discovery.map(|d| d.topics.len()).unwrap_or(0);
            stats.total_topics_discovered += topics_discovered;

            stats.devices.insert(
                device_id.clone(),
                DeviceStats {
                    thing_name: config.thing_name.clone(),
                    connections: ids.len(),
                    topics_discovered,
                    topics_subscribed: connections.iter().map(|c| c.subscribed_topics.len()).sum(),
                    messages_received: connections.iter().map(|c| c.messages_received).sum(),
                    status,
                },
            );
        }

        stats
    }

    /// Stop health checks, close every connection and drop all state
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disconnecting all MQTT connections");

        self.health.close();
        for task in lock(&self.init_tasks).drain(..) {
            task.abort();
        }

        let sessions: Vec<Arc<dyn BrokerSession>> = {
            let mut state = lock(&self.state);
            let sessions: Vec<Arc<dyn BrokerSession>> =
                state.connections.drain().map(|(_, info)| info.session).collect();
            state.device_connections.clear();
            state.discovery.clear();
            state.devices.clear();
            state.device_order.clear();
            sessions
        };
        let closed = sessions.len();
        close_sessions(sessions).await;

        self.bus.clear();
        if let Some(task) = lock(&self.dispatch_task).take() {
            task.abort();
        }
        info!(connections_closed = closed, "All MQTT connections closed");
    }

    pub fn get_device_ids(&self) -> Vec<String> {
        lock(&self.state).device_order.clone()
    }

    pub fn get_device_config(&self, device_id: &str) -> Option<DeviceConfig> {
        lock(&self.state).devices.get(device_id).cloned()
    }

    /// Topics currently subscribed across all of a device's connections
    pub fn subscribed_topics(&self, device_id: &str) -> Vec<String> {
        let state = lock(&self.state);
        state
            .device_connections
            .get(device_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.connections.get(id))
            .flat_map(|info| info.subscribed_topics.iter().cloned())
            .collect()
    }

    pub fn add_message_handler(&self, handler: Arc<dyn MessageHandler>) -> HandlerId {
        self.bus.add_handler(handler)
    }

    pub fn remove_message_handler(&self, id: HandlerId) -> bool {
        self.bus.remove_handler(id)
    }

    pub async fn force_device_retry(&self, device_id: &str) -> BridgeResult<()> {
        self.health.force_retry(device_id).await
    }

    pub fn get_device_health(&self, device_id: &str) -> Option<DeviceHealthStatus> {
        self.health.get_device_health(device_id)
    }

    pub fn get_all_device_health(&self) -> BTreeMap<String, DeviceHealthStatus> {
        self.health.get_all_device_health()
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        self.health.get_health_summary()
    }
}

async fn close_sessions(sessions: Vec<Arc<dyn BrokerSession>>) {
    let results = join_all(sessions.iter().map(|s| s.disconnect())).await;
    for (session, result) in sessions.iter().zip(results) {
        if let Err(e) = result {
            warn!(connection_id = session.connection_id(), error = %e, "Error closing connection");
        }
    }
}

#[async_trait]
impl DeviceInitializer for ConnectionPoolManager {
    async fn initialize_device(&self, config: &DeviceConfig) -> BridgeResult<()> {
        ConnectionPoolManager::initialize_device(self, config).await
    }
}

impl Drop for ConnectionPoolManager {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.dispatch_task).take() {
            task.abort();
        }
        for task in lock(&self.init_tasks).drain(..) {
            task.abort();
        }
    }
}
