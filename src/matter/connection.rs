//! Connection manager for the matter-server websocket
//!
//! Owns the single websocket, the message-id counter and the reconnect
//! supervisor. The session loop is the only writer on the socket: requests
//! from other tasks are queued on an mpsc channel and written from inside the
//! loop, next to frame reads.

use super::protocol::{
    parse_frame, AttributeUpdate, InboundFrame, MessageId, NodeSnapshot, Request, RequestKind,
};
use crate::config::MatterSection;
use crate::observability::metrics::BridgeMetrics;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Outbound requests buffered between `send` and the session writer
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Lifecycle of the device server connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry (attempt count since the last live session)
    Reconnecting(u32),
    /// Terminal; no further reconnects
    Stopped,
}

/// Device server connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Device server not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection manager stopped")]
    Stopped,
    #[error("Connection manager is already running")]
    AlreadyRunning,
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection closed by device server")]
    Closed,
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
}

/// Receiver of decoded device events, called sequentially from the session loop
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Node list from a discovery or subscription response
    async fn on_nodes_listed(&self, nodes: Vec<NodeSnapshot>);
    async fn on_node_added(&self, node: NodeSnapshot);
    async fn on_node_removed(&self, node_id: u64);
    async fn on_attribute_updated(&self, update: AttributeUpdate);
}

/// Fire-and-forget request submission
///
/// Split from the manager so command translation can be exercised without a
/// live websocket.
#[async_trait]
pub trait RequestSink: Send + Sync {
    async fn send(&self, request: Request) -> Result<MessageId, ConnectionError>;
}

/// Connection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub server_url: String,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl From<&MatterSection> for ConnectionSettings {
    fn from(section: &MatterSection) -> Self {
        Self {
            server_url: section.server_url.clone(),
            reconnect_delay: Duration::from_secs(section.reconnect_delay_secs),
            connect_timeout: Duration::from_secs(section.connect_timeout_secs),
        }
    }
}

struct OutboundFrame {
    message_id: MessageId,
    kind: RequestKind,
    text: String,
}

enum SessionEnd {
    Shutdown,
    Closed,
}

/// Single duplex connection to the device server
pub struct ConnectionManager {
    settings: ConnectionSettings,
    metrics: Arc<BridgeMetrics>,
    /// Never reset while the manager is alive, reconnects included
    next_message_id: AtomicU64,
    pending: Mutex<HashMap<String, RequestKind>>,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundFrame>>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, metrics: Arc<BridgeMetrics>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            settings,
            metrics,
            next_message_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            state_tx,
            shutdown_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Number of requests awaiting a response on the current session
    pub fn pending_requests(&self) -> usize {
        self.pending_map().len()
    }

    /// Queue a request for the session writer
    ///
    /// Fails with `NotConnected` unless a session is live; the caller decides
    /// whether to log or retry.
    pub async fn send(&self, request: Request) -> Result<MessageId, ConnectionError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Stopped => return Err(ConnectionError::Stopped),
            state => return Err(ConnectionError::NotConnected { state }),
        }

        let frame = self.prepare(&request)?;
        let message_id = frame.message_id;
        let kind = frame.kind;
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| ConnectionError::Stopped)?;

        debug!(message_id, command = kind.command(), "Queued device server request");
        Ok(message_id)
    }

    /// Stop the supervisor; the live session sends a close frame and no
    /// reconnect is attempted afterwards
    pub fn stop(&self) {
        info!("Stopping device server connection");
        self.shutdown_tx.send_replace(true);
    }

    /// Connect, serve and reconnect until `stop` is called
    ///
    /// Transport failures are never fatal: every lost or refused connection
    /// is retried after the fixed reconnect delay.
    pub async fn run(&self, handler: Arc<dyn FrameHandler>) -> Result<(), ConnectionError> {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ConnectionError::AlreadyRunning)?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempt = 0u32;

        info!(url = %self.settings.server_url, "Starting device server connection supervisor");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting(attempt)
            });

            let outcome = self
                .session(&mut outbound_rx, handler.as_ref(), &mut shutdown_rx)
                .await;
            let was_connected = self.state() == ConnectionState::Connected;

            self.set_state(ConnectionState::Disconnected);
            self.pending_map().clear();
            if was_connected {
                self.metrics.device_connection_lost();
                attempt = 0;
            }

            match outcome {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => warn!("Device server connection closed"),
                Err(e) => warn!(error = %e, "Device server connection failed"),
            }

            attempt += 1;
            self.metrics.device_reconnect_scheduled();
            self.set_state(ConnectionState::Reconnecting(attempt));
            info!(
                attempt,
                delay_secs = self.settings.reconnect_delay.as_secs_f64(),
                "Reconnecting to device server"
            );

            if !interruptible_sleep(&mut shutdown_rx, self.settings.reconnect_delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Stopped);
        info!("Device server connection supervisor stopped");
        Ok(())
    }

    /// One connected session: discovery, subscription, then the read/write loop
    async fn session(
        &self,
        outbound_rx: &mut mpsc::Receiver<OutboundFrame>,
        handler: &dyn FrameHandler,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ConnectionError> {
        let url = self.settings.server_url.as_str();
        let (ws_stream, _) = tokio::time::timeout(self.settings.connect_timeout, connect_async(url))
            .await
            .map_err(|_| ConnectionError::Timeout(self.settings.connect_timeout))?
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        // Requests queued against a previous session were never written
        while let Ok(stale) = outbound_rx.try_recv() {
            self.pending_map().remove(&stale.message_id.to_string());
            warn!(
                message_id = stale.message_id,
                command = stale.kind.command(),
                "Dropping request queued before reconnect"
            );
        }

        self.set_state(ConnectionState::Connected);
        self.metrics.device_connection_established();
        info!(url, "Connected to device server");

        // Discovery strictly before subscription
        for request in [Request::GetNodes, Request::StartListening] {
            let frame = self.prepare(&request)?;
            write
                .send(Message::Text(frame.text.into()))
                .await
                .map_err(|e| ConnectionError::Connect(e.to_string()))?;
            debug!(message_id = frame.message_id, command = frame.kind.command(), "Sent request");
        }

        // Attribute events are ignored until this session has a fresh node list
        let mut discovered = false;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                Some(frame) = outbound_rx.recv() => {
                    write
                        .send(Message::Text(frame.text.into()))
                        .await
                        .map_err(|e| ConnectionError::Connect(e.to_string()))?;
                    debug!(message_id = frame.message_id, command = frame.kind.command(), "Sent request");
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.metrics.frame_received();
                        self.dispatch(text.as_str(), handler, &mut discovered).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Device server sent close frame");
                        return Ok(SessionEnd::Closed);
                    }
                    // Pings are answered by tungstenite itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ConnectionError::Connect(e.to_string())),
                    None => return Err(ConnectionError::Closed),
                },
            }
        }
    }

    /// Route one inbound frame
    async fn dispatch(&self, text: &str, handler: &dyn FrameHandler, discovered: &mut bool) {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.frame_dropped();
                warn!(error = %e, "Dropping device server frame");
                return;
            }
        };

        match frame {
            InboundFrame::AttributeUpdated(update) => {
                if !*discovered {
                    debug!(node_id = update.node_id, path = %update.path, "Attribute event before discovery, skipping");
                    return;
                }
                handler.on_attribute_updated(update).await;
            }
            InboundFrame::NodeAdded(node) => handler.on_node_added(node).await,
            InboundFrame::NodeRemoved { node_id } => handler.on_node_removed(node_id).await,
            InboundFrame::Response { message_id, result } => {
                let kind = self.pending_map().remove(&message_id);
                match result {
                    // Any node list is registered, whichever request produced it
                    Value::Array(items) => {
                        let nodes: Vec<NodeSnapshot> =
                            items.into_iter().filter_map(NodeSnapshot::from_value).collect();
                        info!(
                            message_id = %message_id,
                            command = kind.map(|k| k.command()),
                            count = nodes.len(),
                            "Received node list"
                        );
                        *discovered = true;
                        handler.on_nodes_listed(nodes).await;
                    }
                    _ if kind.map_or(false, |k| k.yields_nodes()) => {
                        warn!(message_id = %message_id, "Expected a node list in response");
                    }
                    _ => debug!(message_id = %message_id, command = kind.map(|k| k.command()), "Request acknowledged"),
                }
            }
            InboundFrame::ErrorResponse { message_id, error } => {
                let kind = self.pending_map().remove(&message_id);
                error!(
                    message_id = %message_id,
                    command = kind.map(|k| k.command()),
                    error = %error,
                    "Device server rejected request"
                );
            }
            InboundFrame::Unrecognized(summary) => {
                debug!(summary = %summary, "Ignoring unrecognized device server frame");
            }
        }
    }

    /// Allocate an id, serialize and record the pending request
    fn prepare(&self, request: &Request) -> Result<OutboundFrame, ConnectionError> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        let text = request
            .to_frame(message_id)
            .map_err(ConnectionError::Serialization)?;
        self.pending_map().insert(message_id.to_string(), kind);
        Ok(OutboundFrame {
            message_id,
            kind,
            text,
        })
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Device connection state changed");
        }
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, RequestKind>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RequestSink for ConnectionManager {
    async fn send(&self, request: Request) -> Result<MessageId, ConnectionError> {
        ConnectionManager::send(self, request).await
    }
}

/// Sleep unless shutdown is requested first; `false` means stop
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown requested during reconnect delay");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}
