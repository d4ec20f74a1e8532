//! Mock implementations for testing
//!
//! Provides an in-memory [`Transport`] and [`RequestSink`] so the publisher and
//! the command path can be tested without a broker or a device server.

use crate::matter::{ConnectionError, MessageId, Request, RequestSink};
use crate::transport::mqtt::{ConnectionState, MqttError};
use crate::transport::{InboundMessage, QoS, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One recorded publication
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock transport for testing
#[derive(Debug, Default)]
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub should_fail: bool,
    connected: AtomicBool,
    message_sender: std::sync::Mutex<Option<mpsc::Sender<InboundMessage>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    /// Most recent publication on a topic
    pub async fn last_on(&self, topic: &str) -> Option<PublishedMessage> {
        self.published_messages
            .lock()
            .await
            .iter()
            .rev()
            .find(|message| message.topic == topic)
            .cloned()
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
    }

    /// Deliver a message as if the broker had routed it to us
    pub async fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        let sender = self
            .message_sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match sender {
            Some(sender) => sender
                .send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                })
                .await
                .is_ok(),
            None => false,
        }
    }

    fn failure(&self) -> MqttError {
        MqttError::NotConnected {
            state: ConnectionState::Disconnected("Mock transport failure".to_string()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(self.failure());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(self.failure());
        }

        self.published_messages.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(self.failure());
        }
        self.subscriptions.lock().await.push(filter.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.should_fail && self.connected.load(Ordering::SeqCst)
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *self
            .message_sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sender);
    }
}

/// Records device requests instead of writing them to a socket
#[derive(Debug, Default)]
pub struct MockRequestSink {
    pub requests: Arc<Mutex<Vec<Request>>>,
    pub should_fail: bool,
    next_id: AtomicU64,
}

impl MockRequestSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send fails as if the device connection were down
    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn sent(&self) -> Vec<Request> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl RequestSink for MockRequestSink {
    async fn send(&self, request: Request) -> Result<MessageId, ConnectionError> {
        if self.should_fail {
            return Err(ConnectionError::NotConnected {
                state: crate::matter::ConnectionState::Reconnecting(1),
            });
        }
        self.requests.lock().await.push(request);
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}
