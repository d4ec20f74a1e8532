//! The bridge context
//!
//! [`Bridge`] owns every long-lived piece of one running bridge: the bus
//! transport, the device connection, the registry, the publisher and the
//! metrics. Nothing is process-global; two bridges in one process never share
//! state.
//!
//! - [`topics`] - topic construction and command topic parsing
//! - [`codec`] - attribute decode table and on/off command encoding
//! - [`registry`] - handle to stable identifier mapping and availability
//! - [`publisher`] - device events to bus publications, bridge summary
//! - [`translator`] - bus commands to device requests

pub mod codec;
pub mod publisher;
pub mod registry;
pub mod topics;
pub mod translator;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::matter::{ConnectionManager, ConnectionSettings, FrameHandler, RequestSink};
use crate::observability::metrics::BridgeMetrics;
use crate::transport::Transport;
use codec::AttributeCodec;
use publisher::StatePublisher;
use registry::DeviceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use topics::TopicBuilder;
use tracing::{error, info, warn, Instrument};
use translator::{CommandTranslator, CommandWorker};

/// Inbound bus messages buffered ahead of the command worker
const COMMAND_QUEUE_CAPACITY: usize = 100;

/// Upper bound on waiting for a background task during shutdown
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One running bridge between the device server and the bus
pub struct Bridge<T: Transport + 'static> {
    config: BridgeConfig,
    transport: Arc<T>,
    connection: Arc<ConnectionManager>,
    request_sink: Arc<dyn RequestSink>,
    publisher: Arc<StatePublisher<T>>,
    registry: DeviceRegistry,
    topics: TopicBuilder,
    codec: AttributeCodec,
    metrics: Arc<BridgeMetrics>,
    shutdown_tx: watch::Sender<bool>,
    connection_handle: Option<JoinHandle<()>>,
    summary_handle: Option<JoinHandle<()>>,
    worker_handle: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> Bridge<T> {
    /// Wire a bridge from configuration; nothing connects until [`start`](Self::start)
    ///
    /// Configurations built in code are validated here as well, so a zero
    /// summary period never reaches the timer.
    pub fn new(config: BridgeConfig, transport: Arc<T>) -> BridgeResult<Self> {
        config.validate()?;
        let metrics = Arc::new(BridgeMetrics::new());
        let topics = TopicBuilder::new(config.mqtt.base_topic.clone());
        let codec = AttributeCodec::new(topics.clone(), config.matter.default_endpoint);
        let registry = DeviceRegistry::new(config.identifier_overrides()?);
        let connection = Arc::new(ConnectionManager::new(
            ConnectionSettings::from(&config.matter),
            metrics.clone(),
        ));
        let publisher = Arc::new(StatePublisher::new(
            transport.clone(),
            registry.clone(),
            codec.clone(),
            topics.clone(),
            metrics.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            transport,
            request_sink: connection.clone(),
            connection,
            publisher,
            registry,
            topics,
            codec,
            metrics,
            shutdown_tx,
            connection_handle: None,
            summary_handle: None,
            worker_handle: None,
        })
    }

    /// Route translated commands somewhere other than the device connection
    pub fn with_request_sink(mut self, sink: Arc<dyn RequestSink>) -> Self {
        self.request_sink = sink;
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn publisher(&self) -> Arc<StatePublisher<T>> {
        self.publisher.clone()
    }

    pub fn connection(&self) -> Arc<ConnectionManager> {
        self.connection.clone()
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        self.metrics.clone()
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Connect the bus, then start the command worker, the summary task and
    /// the device connection
    ///
    /// A bus connection failure here is the one fatal error of the bridge.
    pub async fn start(&mut self) -> BridgeResult<()> {
        if self.connection_handle.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }
        let span = crate::lifecycle_span!(phase = "startup");

        async {
            self.transport
                .connect()
                .await
                .map_err(BridgeError::transport)?;
            info!("Bus transport connected");

            let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
            self.transport.set_message_sender(command_tx);
            self.transport
                .subscribe(&self.topics.command_filter())
                .await
                .map_err(BridgeError::transport)?;

            self.publisher.publish_bridge_state(true).await;

            let worker = CommandWorker::new(
                CommandTranslator::new(
                    self.registry.clone(),
                    self.codec.clone(),
                    self.topics.clone(),
                ),
                self.request_sink.clone(),
                self.metrics.clone(),
                self.config.bridge.command_concurrency,
            );
            self.worker_handle = Some(tokio::spawn(worker.run(command_rx)));

            self.summary_handle = Some(spawn_summary_task(
                self.publisher.clone(),
                Duration::from_secs(self.config.bridge.info_interval_secs),
                self.shutdown_tx.subscribe(),
            ));

            let connection = self.connection.clone();
            let handler: Arc<dyn FrameHandler> = self.publisher.clone();
            self.connection_handle = Some(tokio::spawn(
                async move {
                    if let Err(e) = connection.run(handler).await {
                        error!(error = %e, "Device connection supervisor failed");
                    }
                }
                .instrument(crate::matter_span!(url = %self.config.matter.server_url)),
            ));

            info!(base_topic = self.topics.base(), "Bridge started");
            Ok::<(), BridgeError>(())
        }
        .instrument(span)
        .await
    }

    /// Stop background work, announce `offline`, then disconnect the bus
    pub async fn shutdown(&mut self) -> BridgeResult<()> {
        info!("Shutting down bridge");
        self.shutdown_tx.send_replace(true);
        self.connection.stop();

        join_with_timeout("device connection", self.connection_handle.take()).await;
        join_with_timeout("bridge summary", self.summary_handle.take()).await;

        // The transport holds the worker's sender, so the worker never drains on its own
        if let Some(handle) = self.worker_handle.take() {
            handle.abort();
            let _ = handle.await;
        }

        self.publisher.publish_bridge_state(false).await;
        self.transport
            .disconnect()
            .await
            .map_err(BridgeError::transport)?;

        info!("Bridge shutdown complete");
        Ok(())
    }
}

/// Publish the bridge summary every `period` until shutdown
///
/// The first summary goes out immediately so a fresh subscriber sees the
/// bridge without waiting a full period.
fn spawn_summary_task<T: Transport + 'static>(
    publisher: Arc<StatePublisher<T>>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    publisher.publish_summary().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Bridge summary task stopped");
    })
}

async fn join_with_timeout(name: &str, handle: Option<JoinHandle<()>>) {
    let Some(handle) = handle else {
        return;
    };
    match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(task = name, error = %e, "Task ended abnormally"),
        Err(_) => warn!(task = name, "Task did not stop in time"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matter::Request;
    use crate::testing::mocks::{MockRequestSink, MockTransport};
    use crate::transport::QoS;

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        // Nothing listens here; the device connection just keeps retrying
        config.matter.server_url = "ws://127.0.0.1:9/ws".to_string();
        config
    }

    #[tokio::test]
    async fn test_start_subscribes_and_announces_online() {
        let transport = Arc::new(MockTransport::new());
        let mut bridge = Bridge::new(config(), transport.clone()).unwrap();
        bridge.start().await.unwrap();

        assert_eq!(
            transport.subscriptions.lock().await.clone(),
            vec!["matter/+/set/#".to_string()]
        );
        let state = transport.last_on("matter/bridge/state").await.unwrap();
        assert_eq!(state.payload, b"online");
        assert_eq!(state.qos, QoS::AtLeastOnce);
        assert!(state.retain);

        bridge.shutdown().await.unwrap();
        let state = transport.last_on("matter/bridge/state").await.unwrap();
        assert_eq!(state.payload, b"offline");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_start_fails_without_bus() {
        let transport = Arc::new(MockTransport::with_failure());
        let mut bridge = Bridge::new(config(), transport).unwrap();
        assert!(bridge.start().await.is_err());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = config();
        config.bridge.info_interval_secs = 0;
        let result = Bridge::new(config, Arc::new(MockTransport::new()));
        assert!(matches!(
            result,
            Err(BridgeError::Config(crate::config::ConfigError::InvalidConfig(_)))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let transport = Arc::new(MockTransport::new());
        let mut bridge = Bridge::new(config(), transport).unwrap();
        bridge.start().await.unwrap();
        assert!(matches!(bridge.start().await, Err(BridgeError::AlreadyRunning)));
        bridge.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_summary_published_at_start() {
        let transport = Arc::new(MockTransport::new());
        let mut bridge = Bridge::new(config(), transport.clone()).unwrap();
        bridge.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while transport.last_on("matter/bridge/info").await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        bridge.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_reach_request_sink() {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(MockRequestSink::new());
        let mut bridge = Bridge::new(config(), transport.clone())
            .unwrap()
            .with_request_sink(sink.clone());
        bridge.registry().register(3, serde_json::json!({}));
        bridge.start().await.unwrap();

        assert!(transport.inject("matter/node_3/set/onoff", b"OFF").await);

        tokio::time::timeout(Duration::from_secs(1), async {
            while sink.sent().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let sent = sink.sent().await;
        assert!(matches!(
            &sent[0],
            Request::SendCommand(command) if command.node_id == 3 && command.command_name == "Off"
        ));
        bridge.shutdown().await.unwrap();
    }
}
