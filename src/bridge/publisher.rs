//! State publisher
//!
//! Turns device events into bus publications and keeps the registry current.
//! QoS policy: attributes and the bridge summary go out at-most-once and
//! retained; availability and bridge state at-least-once and retained;
//! join/leave events at-least-once and not retained.

use super::codec::AttributeCodec;
use super::registry::{Device, DeviceRegistry};
use super::topics::TopicBuilder;
use crate::matter::{AttributePath, AttributeUpdate, FrameHandler, NodeSnapshot};
use crate::observability::metrics::{BridgeMetrics, MetricsSnapshot};
use crate::transport::mqtt::connection::{STATE_OFFLINE, STATE_ONLINE};
use crate::transport::{QoS, Transport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Join/leave event kinds on `<base>/bridge/devices`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventKind {
    DeviceJoined,
    DeviceLeft,
}

/// What became of one attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeOutcome {
    Published,
    /// Decoded, but the bus rejected the publish
    PublishFailed,
    /// The codec produced nothing to publish
    Skipped,
}

#[derive(Debug, Serialize)]
struct DeviceEvent<'a> {
    event: DeviceEventKind,
    node_id: u64,
    friendly_name: &'a str,
    timestamp: String,
}

/// One device in the bridge summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub node_id: u64,
    pub friendly_name: String,
    pub available: bool,
    pub last_seen: String,
}

impl From<&Device> for DeviceSummary {
    fn from(device: &Device) -> Self {
        Self {
            node_id: device.handle,
            friendly_name: device.stable_id.clone(),
            available: device.available,
            last_seen: device.last_seen.to_rfc3339(),
        }
    }
}

/// Payload of `<base>/bridge/info`
#[derive(Debug, Clone, Serialize)]
pub struct BridgeSummary {
    pub state: &'static str,
    pub version: &'static str,
    pub devices: Vec<DeviceSummary>,
    pub device_count: usize,
    pub timestamp: String,
    pub stats: MetricsSnapshot,
}

impl BridgeSummary {
    pub fn new(devices: &[Device], stats: MetricsSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            state: STATE_ONLINE,
            version: env!("CARGO_PKG_VERSION"),
            devices: devices.iter().map(DeviceSummary::from).collect(),
            device_count: devices.len(),
            timestamp: now.to_rfc3339(),
            stats,
        }
    }

    /// Friendly names in handle order, for `<base>/bridge/config/devices`
    pub fn names(&self) -> Vec<&str> {
        self.devices
            .iter()
            .map(|device| device.friendly_name.as_str())
            .collect()
    }
}

/// Publishes device state to the bus
pub struct StatePublisher<T: Transport> {
    transport: Arc<T>,
    registry: DeviceRegistry,
    codec: AttributeCodec,
    topics: TopicBuilder,
    metrics: Arc<BridgeMetrics>,
}

impl<T: Transport> StatePublisher<T> {
    pub fn new(
        transport: Arc<T>,
        registry: DeviceRegistry,
        codec: AttributeCodec,
        topics: TopicBuilder,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            transport,
            registry,
            codec,
            topics,
            metrics,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Failures are counted and logged, never propagated
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> bool {
        match self.transport.publish(topic, payload, qos, retain).await {
            Ok(()) => true,
            Err(e) => {
                self.metrics.publish_failed();
                error!(topic, error = %e, "Failed to publish");
                false
            }
        }
    }

    /// Decode and publish one attribute value
    pub async fn publish_attribute(
        &self,
        stable_id: &str,
        path: &AttributePath,
        value: &Value,
    ) -> AttributeOutcome {
        let decoded = match self.codec.decode(stable_id, path, value, Utc::now()) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.metrics.attribute_skipped();
                debug!(stable_id, endpoint = path.endpoint, error = %e, "Skipping attribute");
                return AttributeOutcome::Skipped;
            }
        };

        if self
            .publish(&decoded.topic, decoded.payload.into_bytes(), QoS::AtMostOnce, true)
            .await
        {
            self.metrics.attribute_published();
            AttributeOutcome::Published
        } else {
            AttributeOutcome::PublishFailed
        }
    }

    /// Publish `online`/`offline` for a registered device
    pub async fn publish_availability(&self, handle: u64, available: bool) -> bool {
        let Some(device) = self.registry.get(handle) else {
            return false;
        };
        let payload = if available { STATE_ONLINE } else { STATE_OFFLINE };
        self.publish(
            &self.topics.availability(&device.stable_id),
            payload.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        )
        .await
    }

    /// Register a node, mark it online and publish every attribute it carries
    ///
    /// Returns the number of attributes published.
    pub async fn publish_node(&self, node: &NodeSnapshot) -> usize {
        self.registry.register(node.node_id, node.raw.clone());
        self.registry.set_availability(node.node_id, true);
        self.publish_availability(node.node_id, true).await;

        let stable_id = self.registry.topic_identifier(node.node_id);
        let mut published = 0;
        for (path, value) in &node.attributes {
            let outcome = self.publish_attribute(&stable_id, path, value).await;
            if outcome == AttributeOutcome::Published {
                published += 1;
            }
        }

        info!(
            node_id = node.node_id,
            stable_id = %stable_id,
            attributes = published,
            "Published node state"
        );
        published
    }

    pub async fn publish_device_event(&self, kind: DeviceEventKind, handle: u64) -> bool {
        let friendly_name = self.registry.topic_identifier(handle);
        let event = DeviceEvent {
            event: kind,
            node_id: handle,
            friendly_name: &friendly_name,
            timestamp: Utc::now().to_rfc3339(),
        };
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(node_id = handle, error = %e, "Failed to serialize device event");
                return false;
            }
        };
        self.publish(&self.topics.bridge_devices(), payload, QoS::AtLeastOnce, false)
            .await
    }

    /// Publish the bridge summary and the friendly-name list
    pub async fn publish_summary(&self) -> bool {
        let devices = self.registry.snapshot();
        let summary = BridgeSummary::new(&devices, self.metrics.snapshot(), Utc::now());

        let (info, names) = match (
            serde_json::to_vec(&summary),
            serde_json::to_vec(&summary.names()),
        ) {
            (Ok(info), Ok(names)) => (info, names),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to serialize bridge summary");
                return false;
            }
        };

        let info_sent = self
            .publish(&self.topics.bridge_info(), info, QoS::AtMostOnce, true)
            .await;
        let names_sent = self
            .publish(&self.topics.bridge_device_names(), names, QoS::AtMostOnce, true)
            .await;
        debug!(device_count = summary.device_count, "Published bridge summary");
        info_sent && names_sent
    }

    /// `<base>/bridge/state`, QoS 1 retained
    pub async fn publish_bridge_state(&self, online: bool) -> bool {
        let payload = if online { STATE_ONLINE } else { STATE_OFFLINE };
        self.publish(
            &self.topics.bridge_state(),
            payload.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        )
        .await
    }
}

#[async_trait]
impl<T: Transport + 'static> FrameHandler for StatePublisher<T> {
    async fn on_nodes_listed(&self, nodes: Vec<NodeSnapshot>) {
        let mut attributes = 0;
        for node in &nodes {
            attributes += self.publish_node(node).await;
        }
        info!(nodes = nodes.len(), attributes, "Published discovered nodes");
    }

    async fn on_node_added(&self, node: NodeSnapshot) {
        self.publish_node(&node).await;
        self.publish_device_event(DeviceEventKind::DeviceJoined, node.node_id)
            .await;
    }

    async fn on_node_removed(&self, node_id: u64) {
        if self.registry.set_availability(node_id, false).is_none() {
            info!(node_id, "Ignoring removal of unknown node");
            return;
        }
        self.publish_availability(node_id, false).await;
        self.publish_device_event(DeviceEventKind::DeviceLeft, node_id)
            .await;
    }

    async fn on_attribute_updated(&self, update: AttributeUpdate) {
        let stable_id = self.registry.topic_identifier(update.node_id);
        let outcome = self
            .publish_attribute(&stable_id, &update.path, &update.value)
            .await;
        if outcome == AttributeOutcome::Skipped {
            return;
        }

        // An update implies liveness even when the bus is down; re-announce
        // devices that had gone offline
        if self.registry.set_availability(update.node_id, true) == Some(false) {
            self.publish_availability(update.node_id, true).await;
        }
    }
}
