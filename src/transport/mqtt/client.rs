//! MQTT client I/O: the event loop supervisor and publish path
//!
//! A spawned supervisor polls the rumqttc event loop. On every ConnAck it
//! publishes `online` to `<base>/bridge/state` and restores subscriptions;
//! on errors it waits according to the reconnect policy and polls again,
//! which makes rumqttc reconnect.

use super::connection::{
    configure_mqtt_options, ConnectionState, MqttError, STATE_ONLINE,
};
use super::health_monitor::{
    ConnectionEvent, HealthMonitor, ReconnectPolicy, ReconnectionDecision,
};
use super::message_handler::{EventRoute, MessageHandler};
use crate::bridge::topics::TopicBuilder;
use crate::config::MqttSection;
use crate::transport::{InboundMessage, Transport};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Requests buffered between callers and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;
/// How long the initial connect waits for ConnAck
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on flushing queued packets during disconnect
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type SharedSubscriptions = Arc<Mutex<Vec<String>>>;
type SharedSender = Arc<Mutex<Option<mpsc::Sender<InboundMessage>>>>;

/// MQTT bus client
pub struct MqttClient {
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_tx: watch::Sender<bool>,
    subscriptions: SharedSubscriptions,
    message_sender: SharedSender,
    state_topic: String,
    reconnect_policy: ReconnectPolicy,
}

impl MqttClient {
    pub fn new(config: &MqttSection, topics: &TopicBuilder) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(config, topics)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            client,
            event_loop: Mutex::new(Some(event_loop)),
            event_loop_handle: Mutex::new(None),
            state_tx: Arc::new(state_tx),
            shutdown_tx,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            message_sender: Arc::new(Mutex::new(None)),
            state_topic: topics.bridge_state(),
            reconnect_policy: ReconnectPolicy::default(),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Start the supervisor and wait for the first ConnAck
    ///
    /// A broker that cannot be reached here is fatal to the caller; later
    /// connection losses are retried without limit.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| MqttError::ConnectionFailedStr("Event loop already started".into()))?;

        let state_rx = self.state_tx.subscribe();
        let supervisor = Supervisor {
            client: self.client.clone(),
            state_tx: Arc::clone(&self.state_tx),
            shutdown_rx: self.shutdown_tx.subscribe(),
            subscriptions: Arc::clone(&self.subscriptions),
            message_sender: Arc::clone(&self.message_sender),
            state_topic: self.state_topic.clone(),
            reconnect_policy: self.reconnect_policy.clone(),
        };
        let handle = tokio::spawn(
            supervisor
                .run(event_loop)
                .instrument(crate::mqtt_span!(state_topic = %self.state_topic)),
        );
        *self
            .event_loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        if let Err(e) = wait_for_connection_confirmation(state_rx, CONNACK_TIMEOUT).await {
            self.shutdown_tx.send_replace(true);
            return Err(e);
        }
        Ok(())
    }

    /// Queue DISCONNECT, let the supervisor flush, then stop it
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let disconnect_result = self.client.disconnect().await;
        self.shutdown_tx.send_replace(true);

        let handle = self
            .event_loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match tokio::time::timeout(DRAIN_TIMEOUT + Duration::from_secs(1), handle).await {
                Ok(Ok(())) => debug!("MQTT supervisor stopped"),
                Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "MQTT supervisor ended with error"),
                Err(_) => warn!("MQTT supervisor did not stop in time"),
                _ => {}
            }
        }

        self.state_tx
            .send_replace(HealthMonitor::determine_next_state(ConnectionEvent::StopRequested));
        disconnect_result.map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        info!("MQTT client disconnected");
        Ok(())
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state = self.connection_state();
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        self.check_connection_state()?;
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;
        debug!(target: "mqtt_transport", topic, ?qos, retain, "Published");
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), Self::Error> {
        {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !subscriptions.iter().any(|existing| existing == filter) {
                subscriptions.push(filter.to_string());
            }
        }

        // Recorded filters are restored on every ConnAck
        if !HealthMonitor::can_publish(&self.connection_state()) {
            debug!(filter, "Subscription deferred until connected");
            return Ok(());
        }

        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        info!(filter, "Subscribed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connected)
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *self
            .message_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }
}

/// State moved into the spawned event loop task
struct Supervisor {
    client: AsyncClient,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_rx: watch::Receiver<bool>,
    subscriptions: SharedSubscriptions,
    message_sender: SharedSender,
    state_topic: String,
    reconnect_policy: ReconnectPolicy,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!("Starting MQTT event loop supervisor");
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        drain(&mut event_loop).await;
                        break;
                    }
                }
                event = event_loop.poll() => match event {
                    Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                        EventRoute::ConnectionAcknowledged => {
                            reconnect_attempts = 0;
                            self.state_tx.send_replace(HealthMonitor::determine_next_state(
                                ConnectionEvent::ConnAckReceived,
                            ));
                            self.on_connected();
                        }
                        EventRoute::MessageReceived { topic, payload, retain } => {
                            self.forward(topic, payload, retain).await;
                        }
                        EventRoute::Disconnected => {
                            self.state_tx.send_replace(HealthMonitor::determine_next_state(
                                ConnectionEvent::DisconnectedByBroker,
                            ));
                            if !self.backoff(&mut reconnect_attempts).await {
                                break;
                            }
                        }
                        EventRoute::SubscriptionConfirmed { packet_id, reason_codes } => {
                            debug!(target: "mqtt_transport", packet_id, reason_codes = %reason_codes, "Subscription confirmed");
                        }
                        EventRoute::InfrastructureEvent(event) => {
                            debug!(target: "mqtt_transport", event = %event, "MQTT event");
                        }
                        EventRoute::OutgoingEvent => {}
                    },
                    Err(e) => {
                        self.state_tx.send_replace(HealthMonitor::determine_next_state(
                            ConnectionEvent::NetworkError(e.to_string()),
                        ));
                        if !self.backoff(&mut reconnect_attempts).await {
                            break;
                        }
                    }
                },
            }
        }

        info!("MQTT event loop supervisor stopped");
    }

    /// Announce the bridge and restore subscriptions
    ///
    /// Uses the non-blocking request API: this task is the one draining the
    /// request channel, so awaiting here could deadlock when it is full.
    fn on_connected(&self) {
        if let Err(e) = self
            .client
            .try_publish(&self.state_topic, QoS::AtLeastOnce, true, STATE_ONLINE)
        {
            error!(error = %e, "Failed to publish bridge online state");
        }

        let filters = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for filter in filters {
            match self.client.try_subscribe(&filter, QoS::AtLeastOnce) {
                Ok(()) => debug!(target: "mqtt_transport", filter = %filter, "Re-subscribed"),
                Err(e) => error!(filter = %filter, error = %e, "Failed to re-subscribe"),
            }
        }
    }

    async fn forward(&self, topic: String, payload: Vec<u8>, retain: bool) {
        if !MessageHandler::should_process_message(&topic, retain) {
            return;
        }

        let sender = self
            .message_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match sender {
            Some(sender) => {
                if sender.send(InboundMessage { topic, payload }).await.is_err() {
                    warn!("Inbound message receiver dropped");
                }
            }
            None => warn!(topic = %topic, "No message receiver configured, dropping message"),
        }
    }

    /// Wait before the next poll; `false` when shutdown was requested
    async fn backoff(&mut self, reconnect_attempts: &mut u32) -> bool {
        let shutdown_requested = *self.shutdown_rx.borrow();
        match HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            &self.reconnect_policy,
            shutdown_requested,
        ) {
            ReconnectionDecision::Proceed { attempt, delay } => {
                *reconnect_attempts = attempt;
                self.state_tx.send_replace(HealthMonitor::determine_next_state(
                    ConnectionEvent::ReconnectionStarted(attempt),
                ));
                interruptible_sleep(&mut self.shutdown_rx, delay).await
            }
            ReconnectionDecision::AbortShutdownRequested => false,
        }
    }
}

/// Poll until the connection closes so queued publications and DISCONNECT
/// reach the broker
async fn drain(event_loop: &mut EventLoop) {
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while event_loop.poll().await.is_ok() {}
    })
    .await;
}

/// Wait for the supervisor to report the first ConnAck
async fn wait_for_connection_confirmation(
    mut state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> Result<(), MqttError> {
    let confirmation = tokio::time::timeout(timeout, async {
        loop {
            if state_rx.changed().await.is_err() {
                return Err(MqttError::ConnectionFailedStr(
                    "State channel closed".to_string(),
                ));
            }
            match &*state_rx.borrow() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected(reason) => {
                    return Err(MqttError::ConnectionFailedStr(reason.clone()));
                }
                ConnectionState::Stopped => {
                    return Err(MqttError::ConnectionFailedStr("Client stopped".to_string()));
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
            }
        }
    })
    .await;

    match confirmation {
        Ok(result) => result,
        Err(_) => Err(MqttError::ConnectionFailedStr(
            "ConnAck timeout - no connection confirmation received".to_string(),
        )),
    }
}

/// Returns true if the sleep completed, false if shutdown was requested
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}
