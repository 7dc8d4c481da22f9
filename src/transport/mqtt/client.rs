//! `rumqttc`-backed broker sessions
//!
//! One [`MqttSession`] per pooled connection. Each session owns an event loop
//! task that forwards publishes to the pool, tracks connectivity and resolves
//! pending SubAcks.

use super::connection::{
    configure_mqtt_options, BrokerEndpoint, ConnectionState, MqttError, CONNECT_TIMEOUT,
};
use super::message_handler::{route_mqtt_event, EventRoute, SubAckTracker};
use crate::transport::{BrokerConnector, BrokerSession, ConnectionSpec, InboundMessage, InboundSender};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Request channel capacity between a session and its event loop
const REQUEST_CAPACITY: usize = 64;

/// Pause between polls after the event loop reports an error
const RECONNECT_PERIOD: Duration = Duration::from_secs(1);

/// Upper bound on waiting for a SubAck
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens TLS broker connections with the shared endpoint settings
pub struct MqttConnector {
    endpoint: BrokerEndpoint,
}

impl MqttConnector {
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(
        &self,
        spec: ConnectionSpec,
        inbound: InboundSender,
    ) -> Result<Arc<dyn BrokerSession>, MqttError> {
        let session = MqttSession::connect(&self.endpoint, spec, inbound).await?;
        Ok(Arc::new(session))
    }
}

/// Shared between a session handle and its event loop task
struct SessionShared {
    connected: AtomicBool,
    closing: AtomicBool,
    subacks: StdMutex<SubAckTracker>,
}

impl SessionShared {
    fn with_tracker<R>(&self, f: impl FnOnce(&mut SubAckTracker) -> R) -> R {
        let mut tracker = match self.subacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut tracker)
    }
}

/// One live broker connection
pub struct MqttSession {
    connection_id: String,
    client: AsyncClient,
    shared: Arc<SessionShared>,
    /// Serializes subscribe requests so SubAck waiters queue in packet order
    subscribe_order: Mutex<()>,
    event_loop_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    /// Open a connection and wait for its ConnAck
    pub async fn connect(
        endpoint: &BrokerEndpoint,
        spec: ConnectionSpec,
        inbound: InboundSender,
    ) -> Result<Self, MqttError> {
        let options = configure_mqtt_options(endpoint, &spec)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let shared = Arc::new(SessionShared {
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            subacks: StdMutex::new(SubAckTracker::default()),
        });
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let span = crate::mqtt_span!(
            connection_id = %spec.connection_id,
            device_id = %spec.device_id
        );
        let handle = tokio::spawn(
            run_event_loop(event_loop, spec.clone(), shared.clone(), state_tx, inbound)
                .instrument(span),
        );

        if let Err(e) = wait_for_connection_confirmation(state_rx, CONNECT_TIMEOUT).await {
            shared.closing.store(true, Ordering::SeqCst);
            handle.abort();
            return Err(e);
        }

        info!(
            connection_id = %spec.connection_id,
            device_id = %spec.device_id,
            "MQTT connection established"
        );

        Ok(Self {
            connection_id: spec.connection_id,
            client,
            shared,
            subscribe_order: Mutex::new(()),
            event_loop_handle: StdMutex::new(Some(handle)),
        })
    }

    fn take_event_loop_handle(&self) -> Option<JoinHandle<()>> {
        match self.event_loop_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    async fn subscribe(&self, topic: &str) -> Result<u8, MqttError> {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        {
            let _order = self.subscribe_order.lock().await;
            self.shared.with_tracker(|t| t.enqueue(waiter_tx));
            if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
                self.shared.with_tracker(|t| t.cancel_last());
                return Err(MqttError::SubscriptionFailed(e.to_string()));
            }
        }

        match tokio::time::timeout(SUBACK_TIMEOUT, waiter_rx).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(_)) => Err(MqttError::SubscriptionFailed(format!(
                "connection lost before SubAck for {topic}"
            ))),
            Err(_) => Err(MqttError::SubscriptionFailed(format!(
                "SubAck timeout for {topic}"
            ))),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| MqttError::UnsubscribeFailed(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);

        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| MqttError::ConnectionFailed(e.to_string()));

        if let Some(handle) = self.take_event_loop_handle() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                abort.abort();
            }
        }

        result
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(handle) = self.take_event_loop_handle() {
            handle.abort();
        }
    }
}

/// Wait for ConnAck with timeout
async fn wait_for_connection_confirmation(
    mut state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> Result<(), MqttError> {
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            if state_rx.changed().await.is_err() {
                return Err(MqttError::ConnectionFailed(
                    "event loop stopped before ConnAck".to_string(),
                ));
            }
            match &*state_rx.borrow() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected(reason) => {
                    return Err(MqttError::ConnectionFailed(reason.clone()))
                }
                ConnectionState::Connecting => continue,
            }
        }
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => Err(MqttError::ConnAckTimeout(timeout)),
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    spec: ConnectionSpec,
    shared: Arc<SessionShared>,
    state_tx: watch::Sender<ConnectionState>,
    inbound: InboundSender,
) {
    loop {
        match event_loop.poll().await {
            Ok(event) => match route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => {
                    shared.connected.store(true, Ordering::SeqCst);
                    let _ = state_tx.send(ConnectionState::Connected);
                }
                EventRoute::MessageReceived { topic, payload } => {
                    let message = InboundMessage {
                        connection_id: spec.connection_id.clone(),
                        device_id: spec.device_id.clone(),
                        thing_name: spec.thing_name.clone(),
                        topic,
                        payload,
                    };
                    if inbound.send(message).is_err() {
                        debug!("Inbound receiver dropped, stopping event loop");
                        break;
                    }
                }
                EventRoute::SubscribeSent { packet_id } => {
                    shared.with_tracker(|t| t.on_subscribe_sent(packet_id));
                }
                EventRoute::SubscriptionAcknowledged { packet_id, granted } => {
                    shared.with_tracker(|t| t.on_suback(packet_id, &granted));
                }
                EventRoute::Disconnected => {
                    shared.connected.store(false, Ordering::SeqCst);
                    warn!("Broker sent disconnect");
                }
                EventRoute::Other => {}
            },
            Err(e) => {
                if shared.closing.load(Ordering::SeqCst) {
                    break;
                }

                let was_connected = shared.connected.swap(false, Ordering::SeqCst);
                shared.with_tracker(|t| t.fail_all());
                let _ = state_tx.send(ConnectionState::Disconnected(e.to_string()));

                if was_connected {
                    warn!(error = %e, "MQTT connection closed, reconnecting");
                } else {
                    debug!(error = %e, "MQTT connection attempt failed");
                }

                tokio::time::sleep(RECONNECT_PERIOD).await;
            }
        }
    }
}
