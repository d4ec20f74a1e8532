//! Attribute codec
//!
//! Pure mapping between device attributes and bus messages. Decoding is
//! driven by a fixed table keyed by `(cluster, attribute)`; anything not in
//! the table is passed through under a `cluster_<hex>/attr_<hex>` topic.
//! Encoding covers the on/off cluster only.

use super::topics::TopicBuilder;
use crate::matter::protocol::{AttributePath, DeviceCommand};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const CLUSTER_POWER_SOURCE: u32 = 0x0001;
pub const CLUSTER_ON_OFF: u32 = 0x0006;
pub const CLUSTER_THREAD_DIAGNOSTICS: u32 = 0x0034;
pub const CLUSTER_AIR_QUALITY: u32 = 0x005B;
pub const CLUSTER_TEMPERATURE: u32 = 0x0402;
pub const CLUSTER_HUMIDITY: u32 = 0x0405;
pub const CLUSTER_CO2: u32 = 0x040D;
pub const CLUSTER_PM25: u32 = 0x042A;

/// Endpoint targeted by commands unless the caller names one
pub const DEFAULT_ENDPOINT: u16 = 1;

/// How a raw attribute value becomes a payload
#[derive(Debug, Clone, Copy, PartialEq)]
enum Transform {
    /// `{<key>: value / divisor, unit, timestamp}`, optionally rounded to 0.1
    Measurement {
        key: &'static str,
        divisor: f64,
        unit: &'static str,
        round: bool,
    },
    /// `{quality, value, timestamp}`
    AirQuality,
    /// Literal `ON` / `OFF`
    OnOff,
    /// Raw value, no wrapper
    Passthrough,
}

struct AttributeMapping {
    cluster: u32,
    /// `None` matches every attribute of the cluster
    attribute: Option<u32>,
    suffix: &'static str,
    transform: Transform,
}

const ATTRIBUTE_TABLE: &[AttributeMapping] = &[
    AttributeMapping {
        cluster: CLUSTER_TEMPERATURE,
        attribute: Some(0x0000),
        suffix: "temperature",
        transform: Transform::Measurement {
            key: "temperature",
            divisor: 100.0,
            unit: "°C",
            round: true,
        },
    },
    AttributeMapping {
        cluster: CLUSTER_HUMIDITY,
        attribute: Some(0x0000),
        suffix: "humidity",
        transform: Transform::Measurement {
            key: "humidity",
            divisor: 100.0,
            unit: "%",
            round: true,
        },
    },
    AttributeMapping {
        cluster: CLUSTER_AIR_QUALITY,
        attribute: Some(0x0000),
        suffix: "air_quality",
        transform: Transform::AirQuality,
    },
    AttributeMapping {
        cluster: CLUSTER_CO2,
        attribute: Some(0x0000),
        suffix: "co2",
        transform: Transform::Measurement {
            key: "co2",
            divisor: 1.0,
            unit: "ppm",
            round: true,
        },
    },
    AttributeMapping {
        cluster: CLUSTER_PM25,
        attribute: Some(0x0000),
        suffix: "pm25",
        transform: Transform::Measurement {
            key: "pm25",
            divisor: 1.0,
            unit: "µg/m³",
            round: true,
        },
    },
    AttributeMapping {
        cluster: CLUSTER_ON_OFF,
        attribute: Some(0x0000),
        suffix: "state",
        transform: Transform::OnOff,
    },
    // BatteryPercentageRemaining is reported in half percent steps
    AttributeMapping {
        cluster: CLUSTER_POWER_SOURCE,
        attribute: Some(0x0021),
        suffix: "battery",
        transform: Transform::Measurement {
            key: "battery",
            divisor: 2.0,
            unit: "%",
            round: false,
        },
    },
    AttributeMapping {
        cluster: CLUSTER_THREAD_DIAGNOSTICS,
        attribute: None,
        suffix: "linkquality",
        transform: Transform::Passthrough,
    },
];

const AIR_QUALITY_LEVELS: [&str; 7] = [
    "unknown",
    "good",
    "fair",
    "moderate",
    "poor",
    "very_poor",
    "extremely_poor",
];

/// Bus payload produced by the codec
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    /// Published verbatim, not JSON encoded
    Text(String),
}

impl Payload {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Json(value) => value.to_string().into_bytes(),
            Payload::Text(text) => text.into_bytes(),
        }
    }
}

/// Topic and payload for one attribute value
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAttribute {
    pub topic: String,
    pub payload: Payload,
}

/// Reasons an attribute is not published
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("Non-numeric value for cluster 0x{cluster:04x} attribute 0x{attribute:04x}")]
    NonNumeric { cluster: u32, attribute: u32 },
}

/// On/off cluster commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnOffCommand {
    Off,
    On,
    Toggle,
}

impl OnOffCommand {
    pub fn command_id(&self) -> u32 {
        match self {
            OnOffCommand::Off => 0x00,
            OnOffCommand::On => 0x01,
            OnOffCommand::Toggle => 0x02,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OnOffCommand::Off => "Off",
            OnOffCommand::On => "On",
            OnOffCommand::Toggle => "Toggle",
        }
    }
}

/// Stateless codec bound to a base topic
#[derive(Debug, Clone)]
pub struct AttributeCodec {
    topics: TopicBuilder,
    default_endpoint: u16,
}

impl AttributeCodec {
    pub fn new(topics: TopicBuilder, default_endpoint: u16) -> Self {
        Self {
            topics,
            default_endpoint,
        }
    }

    /// Decode one attribute value
    ///
    /// Paths are complete by construction; frames missing a cluster or
    /// attribute id are rejected while parsing and never reach the codec.
    pub fn decode(
        &self,
        stable_id: &str,
        path: &AttributePath,
        value: &Value,
        now: DateTime<Utc>,
    ) -> Result<DecodedAttribute, CodecError> {
        let AttributePath {
            cluster, attribute, ..
        } = *path;

        let Some(mapping) = lookup(cluster, attribute) else {
            let suffix = format!("cluster_{cluster:04x}/attr_{attribute:04x}");
            return Ok(DecodedAttribute {
                topic: self.topics.attribute(stable_id, &suffix),
                payload: passthrough(value),
            });
        };

        let timestamp = now.to_rfc3339();
        let payload = match mapping.transform {
            Transform::Measurement {
                key,
                divisor,
                unit,
                round,
            } => {
                let raw = value
                    .as_f64()
                    .ok_or(CodecError::NonNumeric { cluster, attribute })?;
                // Unscaled integers stay integers
                let reading = if divisor == 1.0 && (value.is_i64() || value.is_u64()) {
                    value.clone()
                } else if round {
                    json!(round_tenth(raw / divisor))
                } else {
                    json!(raw / divisor)
                };
                let mut body = Map::new();
                body.insert(key.to_string(), reading);
                body.insert("unit".to_string(), json!(unit));
                body.insert("timestamp".to_string(), json!(timestamp));
                Payload::Json(Value::Object(body))
            }
            Transform::AirQuality => {
                let quality = value
                    .as_u64()
                    .and_then(|level| AIR_QUALITY_LEVELS.get(level as usize))
                    .copied()
                    .unwrap_or("unknown");
                Payload::Json(json!({
                    "quality": quality,
                    "value": value,
                    "timestamp": timestamp,
                }))
            }
            Transform::OnOff => {
                let state = if is_truthy(value) { "ON" } else { "OFF" };
                Payload::Text(state.to_string())
            }
            Transform::Passthrough => passthrough(value),
        };

        Ok(DecodedAttribute {
            topic: self.topics.attribute(stable_id, mapping.suffix),
            payload,
        })
    }

    /// Translate a bus command into a device command
    ///
    /// Only the `onoff` cluster is supported. The topic command wins over the
    /// payload; both are compared case-insensitively. Anything unsupported
    /// yields `None`.
    pub fn encode(
        &self,
        node_id: u64,
        cluster: &str,
        command: &str,
        payload: &str,
        endpoint: Option<u16>,
    ) -> Option<DeviceCommand> {
        if !cluster.eq_ignore_ascii_case("onoff") {
            return None;
        }

        let action = on_off_action(command, payload)?;
        Some(DeviceCommand {
            node_id,
            endpoint_id: endpoint.unwrap_or(self.default_endpoint),
            cluster_id: CLUSTER_ON_OFF,
            command_id: action.command_id(),
            command_name: action.name().to_string(),
            payload: Map::new(),
        })
    }
}

fn lookup(cluster: u32, attribute: u32) -> Option<&'static AttributeMapping> {
    ATTRIBUTE_TABLE.iter().find(|m| {
        m.cluster == cluster && m.attribute.map_or(true, |expected| expected == attribute)
    })
}

fn on_off_action(command: &str, payload: &str) -> Option<OnOffCommand> {
    parse_on_off(command).or_else(|| parse_on_off(payload.trim().trim_matches('"')))
}

fn parse_on_off(word: &str) -> Option<OnOffCommand> {
    match word.trim().to_ascii_lowercase().as_str() {
        "on" => Some(OnOffCommand::On),
        "off" => Some(OnOffCommand::Off),
        "toggle" => Some(OnOffCommand::Toggle),
        _ => None,
    }
}

fn passthrough(value: &Value) -> Payload {
    match value {
        Value::String(s) => Payload::Text(s.clone()),
        other => Payload::Text(other.to_string()),
    }
}

/// Nearest tenth of the exact binary value, ties to even
fn round_tenth(value: f64) -> f64 {
    format!("{value:.1}").parse().unwrap_or(value)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
