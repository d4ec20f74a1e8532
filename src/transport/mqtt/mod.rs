//! MQTT bus client built on rumqttc (MQTT v5)
//!
//! Pure pieces are kept apart from I/O so they can be tested in isolation:
//!
//! - [`connection`] - broker options, last will, connection state and errors
//! - [`message_handler`] - event routing and inbound message filtering
//! - [`health_monitor`] - state transitions and reconnect decisions
//! - [`client`] - the event loop supervisor and [`Transport`](crate::transport::Transport) implementation
//!
//! # Usage
//!
//! ```rust,no_run
//! use matter_mqtt_bridge::bridge::topics::TopicBuilder;
//! use matter_mqtt_bridge::config::MqttSection;
//! use matter_mqtt_bridge::transport::mqtt::MqttClient;
//! use matter_mqtt_bridge::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection::default();
//! let client = MqttClient::new(&config, &TopicBuilder::new("matter"))?;
//! client.connect().await?;
//! client.subscribe("matter/+/set/#").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectPolicy, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
