//! End-to-end bridge flow over mock seams
//!
//! Device events go in through the publisher's frame handler; commands come
//! in through the mock bus and land on the mock request sink.

use matter_mqtt_bridge::bridge::Bridge;
use matter_mqtt_bridge::config::{BridgeConfig, DeviceOverride};
use matter_mqtt_bridge::matter::{FrameHandler, NodeSnapshot, Request};
use matter_mqtt_bridge::testing::mocks::{MockRequestSink, MockTransport};
use matter_mqtt_bridge::transport::QoS;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.matter.server_url = "ws://127.0.0.1:9/ws".to_string();
    config.devices.insert(
        "12".to_string(),
        DeviceOverride {
            friendly_name: "kitchen-lamp".to_string(),
        },
    );
    config
}

async fn started() -> (
    Bridge<MockTransport>,
    Arc<MockTransport>,
    Arc<MockRequestSink>,
) {
    let transport = Arc::new(MockTransport::new());
    let sink = Arc::new(MockRequestSink::new());
    let mut bridge = Bridge::new(config(), transport.clone())
        .unwrap()
        .with_request_sink(sink.clone());
    bridge.start().await.unwrap();
    (bridge, transport, sink)
}

async fn wait_for_requests(sink: &MockRequestSink, count: usize) -> Vec<Request> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let sent = sink.sent().await;
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("requests were not sent in time")
}

#[tokio::test]
async fn test_friendly_name_command_reaches_device() {
    let (mut bridge, transport, sink) = started().await;

    let node = NodeSnapshot::from_value(json!({"node_id": 12})).unwrap();
    bridge.publisher().on_node_added(node).await;

    let availability = transport
        .last_on("matter/kitchen-lamp/availability")
        .await
        .unwrap();
    assert_eq!(availability.payload, b"online");

    assert!(
        transport
            .inject("matter/kitchen-lamp/set/onoff/on", b"\"ON\"")
            .await
    );

    let sent = wait_for_requests(&sink, 1).await;
    // Give a duplicate a chance to show up before counting
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.sent().await.len(), 1);

    match &sent[0] {
        Request::SendCommand(command) => {
            assert_eq!(command.node_id, 12);
            assert_eq!(command.endpoint_id, 1);
            assert_eq!(command.cluster_id, 6);
            assert_eq!(command.command_name, "On");
        }
        other => panic!("unexpected request {other:?}"),
    }

    let stats = bridge.metrics().snapshot();
    assert_eq!(stats.commands.received, 1);
    assert_eq!(stats.commands.sent, 1);

    bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_removed_device_goes_offline_but_stays_addressable() {
    let (mut bridge, transport, sink) = started().await;
    let publisher = bridge.publisher();

    publisher
        .on_node_added(NodeSnapshot::from_value(json!({"node_id": 7})).unwrap())
        .await;
    publisher.on_node_removed(7).await;

    let availability = transport.last_on("matter/node_7/availability").await.unwrap();
    assert_eq!(availability.payload, b"offline");
    assert_eq!(availability.qos, QoS::AtLeastOnce);
    assert!(availability.retain);

    let left = transport.last_on("matter/bridge/devices").await.unwrap();
    let event: serde_json::Value = serde_json::from_slice(&left.payload).unwrap();
    assert_eq!(event["event"], "device_left");
    assert_eq!(event["node_id"], 7);

    assert_eq!(bridge.registry().resolve("node_7"), Some(7));
    assert!(!bridge.registry().get(7).unwrap().available);

    // Still accepts commands while offline
    assert!(transport.inject("matter/node_7/set/onoff/toggle", b"").await);
    let sent = wait_for_requests(&sink, 1).await;
    assert!(matches!(
        &sent[0],
        Request::SendCommand(command) if command.node_id == 7 && command.command_name == "Toggle"
    ));

    bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_device_command_is_dropped() {
    let (mut bridge, transport, sink) = started().await;

    assert!(transport.inject("matter/ghost/set/onoff/on", b"").await);
    tokio::time::timeout(Duration::from_secs(2), async {
        while bridge.metrics().snapshot().commands.dropped == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(sink.sent().await.is_empty());
    bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_summary_lists_registered_devices() {
    let (mut bridge, transport, _sink) = started().await;
    let publisher = bridge.publisher();

    // Let the startup summary go out first so it cannot overwrite ours
    tokio::time::timeout(Duration::from_secs(2), async {
        while transport.last_on("matter/bridge/info").await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    for node_id in [12, 3] {
        publisher
            .on_node_added(NodeSnapshot::from_value(json!({"node_id": node_id})).unwrap())
            .await;
    }
    assert!(publisher.publish_summary().await);

    let info = transport.last_on("matter/bridge/info").await.unwrap();
    let summary: serde_json::Value = serde_json::from_slice(&info.payload).unwrap();
    assert_eq!(summary["state"], "online");
    assert_eq!(summary["device_count"], 2);
    assert_eq!(summary["devices"][0]["friendly_name"], "node_3");
    assert_eq!(summary["devices"][1]["friendly_name"], "kitchen-lamp");
    assert_eq!(summary["version"], env!("CARGO_PKG_VERSION"));

    let names = transport.last_on("matter/bridge/config/devices").await.unwrap();
    let names: Vec<String> = serde_json::from_slice(&names.payload).unwrap();
    assert_eq!(names, vec!["node_3", "kitchen-lamp"]);

    bridge.shutdown().await.unwrap();
}
