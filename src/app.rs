//! Bridge composition root and lifecycle
//!
//! Owns the message bus, the connection pool, one stream manager per device and
//! the command handler. `start` wires inbound telemetry into the stream managers
//! and initializes every device; `shutdown` tears it all down again.

use crate::bus::{HandlerId, MessageBus};
use crate::command::CommandHandler;
use crate::config::{BridgeConfig, DeviceConfig, SubscriptionMode};
use crate::error::{BridgeError, BridgeResult};
use crate::health::RetryPolicy;
use crate::observability::ProcessingMetrics;
use crate::pool::{ConnectionPoolManager, PoolTiming};
use crate::stream::{BatchSink, HttpSink, StreamManager};
use crate::transport::mqtt::{BrokerEndpoint, MqttConnector};
use crate::transport::BrokerConnector;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Whether a device's subscription mode admits `topic`
pub fn should_process_message(device: &DeviceConfig, topic: &str) -> bool {
    match device.topics.mode {
        SubscriptionMode::Selected => device.topics.list.iter().any(|t| t == topic),
        SubscriptionMode::All | SubscriptionMode::DataAll => true,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct BridgeApp {
    config: BridgeConfig,
    bus: Arc<MessageBus>,
    pool: Arc<ConnectionPoolManager>,
    streams: Arc<BTreeMap<String, Arc<StreamManager>>>,
    commands: Arc<CommandHandler>,
    processing_active: Arc<AtomicBool>,
    metrics: Arc<ProcessingMetrics>,
    handler_id: Mutex<Option<HandlerId>>,
    cooldown_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl BridgeApp {
    /// Build the production bridge: rumqttc connector and HTTP sink
    pub fn from_config(config: BridgeConfig) -> BridgeResult<Arc<Self>> {
        let endpoint = BrokerEndpoint::from_config(&config.mqtt, config.certs.as_ref())?;
        let connector: Arc<dyn BrokerConnector> = Arc::new(MqttConnector::new(endpoint));
        let sink: Arc<dyn BatchSink> = Arc::new(HttpSink::new(&config.stream.parameters)?);
        Ok(Self::new(config, connector, sink, PoolTiming::default()))
    }

    /// Assemble the bridge around injected transport and sink
    pub fn new(
        config: BridgeConfig,
        connector: Arc<dyn BrokerConnector>,
        sink: Arc<dyn BatchSink>,
        timing: PoolTiming,
    ) -> Arc<Self> {
        let bus = Arc::new(MessageBus::new());
        let pool = ConnectionPoolManager::with_timing(
            connector,
            bus.clone(),
            RetryPolicy::from(&config.health),
            timing,
        );

        let start_paused = !config.stream.parameters.streaming.enabled;
        let streams: BTreeMap<String, Arc<StreamManager>> = config
            .devices
            .iter()
            .map(|device| {
                let rate = Duration::from_millis(config.stream_rate_for(device));
                let manager = StreamManager::new(device, rate, start_paused, sink.clone());
                (device.device_id.clone(), manager)
            })
            .collect();
        if start_paused {
            warn!("Streaming disabled in configuration, stream managers start paused");
        }

        let commands = Arc::new(CommandHandler::new(pool.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            bus,
            pool,
            streams: Arc::new(streams),
            commands,
            processing_active: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(ProcessingMetrics::new()),
            handler_id: Mutex::new(None),
            cooldown_task: Mutex::new(None),
            shutdown_tx,
            stopped: AtomicBool::new(false),
        })
    }

    /// Route telemetry into the stream managers, initialize devices, then arm the cooldown
    pub async fn start(&self) -> BridgeResult<()> {
        info!(
            device_count = self.config.devices.len(),
            "Starting telemetry bridge"
        );

        let devices: Arc<HashMap<String, DeviceConfig>> = Arc::new(
            self.config
                .devices
                .iter()
                .map(|d| (d.device_id.clone(), d.clone()))
                .collect(),
        );
        let streams = self.streams.clone();
        let active = self.processing_active.clone();
        let metrics = self.metrics.clone();

        let handler = move |device_id: &str, topic: &str, payload: &str| {
            if !active.load(Ordering::SeqCst) {
                return;
            }
            let Some(device) = devices.get(device_id) else {
                return;
            };
            let started = Instant::now();
            let accepted = should_process_message(device, topic);
            metrics.record_message(started.elapsed());
            if !accepted {
                debug!(device_id, topic, "Topic filtered by subscription mode");
                return;
            }
            if let Some(stream) = streams.get(device_id) {
                stream.push_message(topic, payload);
            }
        };
        *lock(&self.handler_id) = Some(self.bus.add_handler(Arc::new(handler)));

        self.pool.initialize(&self.config.devices).await?;

        let cooldown = Duration::from_secs(self.config.bridge.cooldown_secs);
        info!(
            cooldown_secs = cooldown.as_secs(),
            "Devices initialized, data processing starts after cooldown"
        );
        let active = self.processing_active.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            active.store(true, Ordering::SeqCst);
            info!("Data processing activated");
        });
        *lock(&self.cooldown_task) = Some(task);

        Ok(())
    }

    /// Ask the running process to shut down; picked up by [`Self::wait_for_shutdown_request`]
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_trigger(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub async fn wait_for_shutdown_request(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        // A closed channel cannot happen while self holds the sender
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Stop health checks, close every broker connection and stop every stream
    pub async fn shutdown(&self) -> BridgeResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Graceful shutdown started");

        if let Some(task) = lock(&self.cooldown_task).take() {
            task.abort();
        }
        self.processing_active.store(false, Ordering::SeqCst);
        if let Some(id) = lock(&self.handler_id).take() {
            self.bus.remove_handler(id);
        }

        self.pool.disconnect().await;
        for stream in self.streams.values() {
            stream.stop();
        }

        info!("Graceful shutdown complete");
        Ok(())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn pool(&self) -> &Arc<ConnectionPoolManager> {
        &self.pool
    }

    pub fn commands(&self) -> &Arc<CommandHandler> {
        &self.commands
    }

    pub fn streams(&self) -> &BTreeMap<String, Arc<StreamManager>> {
        &self.streams
    }

    pub fn stream(&self, device_id: &str) -> BridgeResult<&Arc<StreamManager>> {
        self.streams
            .get(device_id)
            .ok_or_else(|| BridgeError::device_not_found(device_id))
    }

    pub fn metrics(&self) -> &ProcessingMetrics {
        &self.metrics
    }

    pub fn processing_active(&self) -> bool {
        self.processing_active.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selected_mode_filters_topics() {
        let mut device = DeviceConfig::new("dev-1", "thing-1", SubscriptionMode::Selected);
        device.topics.list = vec!["a/b".to_string()];

        assert!(should_process_message(&device, "a/b"));
        assert!(!should_process_message(&device, "c/d"));
    }

    #[test]
    fn test_all_modes_accept_everything() {
        let all = DeviceConfig::new("dev-1", "thing-1", SubscriptionMode::All);
        let data_all = DeviceConfig::new("dev-1", "thing-1", SubscriptionMode::DataAll);
        assert!(should_process_message(&all, "c/d"));
        assert!(should_process_message(&data_all, "c/d"));
    }

    #[test]
    fn test_selected_mode_with_empty_list_accepts_nothing() {
        let device = DeviceConfig::new("dev-1", "thing-1", SubscriptionMode::Selected);
        assert!(!should_process_message(&device, "a/b"));
    }
}
