//! Matter to MQTT bridge
//!
//! Mirrors the devices of a matter-server websocket into MQTT topics and turns
//! MQTT command messages back into device commands.
//!
//! # Overview
//!
//! - [`matter`] - the device server connection: framing, reconnects, dispatch
//! - [`bridge`] - registry, attribute codec, publisher and command translator
//! - [`transport`] - the bus seam and its rumqttc implementation
//! - [`config`], [`error`], [`observability`] - the ambient pieces
//!
//! # Quick Start
//!
//! ```rust
//! use matter_mqtt_bridge::bridge::codec::{AttributeCodec, CLUSTER_TEMPERATURE};
//! use matter_mqtt_bridge::bridge::topics::TopicBuilder;
//! use matter_mqtt_bridge::matter::AttributePath;
//! use serde_json::json;
//!
//! let codec = AttributeCodec::new(TopicBuilder::new("matter"), 1);
//! let decoded = codec
//!     .decode(
//!         "kitchen",
//!         &AttributePath::new(1, CLUSTER_TEMPERATURE, 0),
//!         &json!(2150),
//!         chrono::Utc::now(),
//!     )
//!     .unwrap();
//! assert_eq!(decoded.topic, "matter/kitchen/temperature");
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod matter;
pub mod observability;
pub mod testing;
pub mod transport;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use transport::mqtt::MqttClient;
