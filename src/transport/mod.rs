//! Bus transport layer
//!
//! The bridge publishes device state and receives commands through the
//! [`Transport`] trait so the publisher and command path can run against an
//! in-memory transport in tests. [`mqtt`] holds the rumqttc implementation.

use tokio::sync::mpsc;

pub mod mqtt;

pub use rumqttc::v5::mqttbytes::QoS;

/// Message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe bus seam
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker; returns once the broker has accepted the session
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Disconnect from the broker after flushing queued publications
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Publish a payload
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error>;

    /// Subscribe to a topic filter, kept across reconnects
    async fn subscribe(&self, filter: &str) -> Result<(), Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Set the channel receiving messages from subscribed topics
    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>);
}
