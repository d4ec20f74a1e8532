//! Wire types for the matter-server websocket
//!
//! Outbound requests are `{message_id, command, args}` JSON frames. Inbound
//! frames are either events (`{event, data}`) or responses keyed by the
//! message id of the request that produced them. Parsing here is pure; the
//! connection manager decides what to do with each frame.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Identifier attached to every outbound request
pub type MessageId = u64;

/// What an outbound request asked for, kept to interpret its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    GetNodes,
    StartListening,
    SendCommand,
}

impl RequestKind {
    /// Command string understood by the device server
    pub fn command(&self) -> &'static str {
        match self {
            RequestKind::GetNodes => "get_nodes",
            RequestKind::StartListening => "start_listening",
            RequestKind::SendCommand => "device.send_command",
        }
    }

    /// Whether a successful result of this request is a node list
    pub fn yields_nodes(&self) -> bool {
        matches!(self, RequestKind::GetNodes | RequestKind::StartListening)
    }
}

/// Cluster command addressed to one endpoint of one node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceCommand {
    pub node_id: u64,
    pub endpoint_id: u16,
    pub cluster_id: u32,
    pub command_id: u32,
    pub command_name: String,
    pub payload: Map<String, Value>,
}

/// Request sent to the device server
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// List every known node with its attributes
    GetNodes,
    /// Subscribe to node and attribute events
    StartListening,
    /// Invoke a cluster command on a node
    SendCommand(DeviceCommand),
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    message_id: String,
    command: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<&'a DeviceCommand>,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::GetNodes => RequestKind::GetNodes,
            Request::StartListening => RequestKind::StartListening,
            Request::SendCommand(_) => RequestKind::SendCommand,
        }
    }

    /// Serialize into a text frame; message ids travel as strings
    pub fn to_frame(&self, message_id: MessageId) -> Result<String, serde_json::Error> {
        let args = match self {
            Request::SendCommand(command) => Some(command),
            Request::GetNodes | Request::StartListening => None,
        };
        serde_json::to_string(&OutboundFrame {
            message_id: message_id.to_string(),
            command: self.kind().command(),
            args,
        })
    }
}

/// Fully specified attribute address within a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributePath {
    pub endpoint: u16,
    pub cluster: u32,
    pub attribute: u32,
}

impl AttributePath {
    pub fn new(endpoint: u16, cluster: u32, attribute: u32) -> Self {
        Self {
            endpoint,
            cluster,
            attribute,
        }
    }

    /// Parse the `"endpoint/cluster/attribute"` form used in event lists and node dumps
    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path.split('/');
        let endpoint = parts.next()?.trim().parse().ok()?;
        let cluster = parts.next()?.trim().parse().ok()?;
        let attribute = parts.next()?.trim().parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(endpoint, cluster, attribute))
    }

    /// Build from the dict form `{endpoint_id, cluster_id, attribute_id}`
    ///
    /// Returns `None` unless all three fields are present and numeric.
    pub fn from_object(object: &Value) -> Option<Self> {
        let endpoint = object.get("endpoint_id")?.as_u64()?;
        let cluster = object.get("cluster_id")?.as_u64()?;
        let attribute = object.get("attribute_id")?.as_u64()?;
        Some(Self::new(
            u16::try_from(endpoint).ok()?,
            u32::try_from(cluster).ok()?,
            u32::try_from(attribute).ok()?,
        ))
    }
}

impl std::fmt::Display for AttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.endpoint, self.cluster, self.attribute)
    }
}

/// A single attribute change reported by the device server
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeUpdate {
    pub node_id: u64,
    pub path: AttributePath,
    pub value: Value,
}

/// Node description as delivered by discovery results and `node_added`
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub node_id: u64,
    /// Attributes with a well-formed path; malformed keys are dropped
    pub attributes: Vec<(AttributePath, Value)>,
    pub raw: Value,
}

impl NodeSnapshot {
    /// Interpret a node object; `None` without a numeric `node_id`
    pub fn from_value(raw: Value) -> Option<Self> {
        let node_id = raw.get("node_id")?.as_u64()?;
        let attributes = raw
            .get("attributes")
            .and_then(Value::as_object)
            .map(|attrs| {
                attrs
                    .iter()
                    .filter_map(|(key, value)| {
                        AttributePath::parse(key).map(|path| (path, value.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            node_id,
            attributes,
            raw,
        })
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    AttributeUpdated(AttributeUpdate),
    NodeAdded(NodeSnapshot),
    NodeRemoved { node_id: u64 },
    Response { message_id: String, result: Value },
    ErrorResponse { message_id: String, error: String },
    /// Server info banners, unknown events and other frames the bridge ignores
    Unrecognized(String),
}

/// Frame decoding failures; each one drops a single frame
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("Invalid JSON frame: {0}")]
    Json(String),
    #[error("Malformed '{event}' event: {reason}")]
    Malformed { event: String, reason: String },
}

/// Decode one text frame from the device server
pub fn parse_frame(text: &str) -> Result<InboundFrame, FrameError> {
    let frame: Value = serde_json::from_str(text).map_err(|e| FrameError::Json(e.to_string()))?;

    if let Some(event) = frame.get("event").and_then(Value::as_str) {
        // Events carry their payload under `data`; older servers inline it
        let data = frame.get("data").cloned().unwrap_or_else(|| frame.clone());
        return parse_event(event, data);
    }

    if let Some(message_id) = frame.get("message_id").map(message_id_string) {
        if let Some(error) = error_text(&frame) {
            return Ok(InboundFrame::ErrorResponse { message_id, error });
        }
        let result = frame.get("result").cloned().unwrap_or(Value::Null);
        return Ok(InboundFrame::Response { message_id, result });
    }

    Ok(InboundFrame::Unrecognized(summarize(&frame)))
}

fn parse_event(event: &str, data: Value) -> Result<InboundFrame, FrameError> {
    let malformed = |reason: &str| FrameError::Malformed {
        event: event.to_string(),
        reason: reason.to_string(),
    };

    match event {
        "attribute_updated" => parse_attribute_update(&data)
            .map(InboundFrame::AttributeUpdated)
            .ok_or_else(|| malformed("expected a node id, a complete attribute path and a value")),
        "node_added" => {
            // Either {node_id, node: {...}} or the node object itself
            let node = match data.get("node").filter(|inner| inner.is_object()).cloned() {
                Some(mut inner) => {
                    if inner.get("node_id").is_none() {
                        if let (Some(obj), Some(id)) = (inner.as_object_mut(), data.get("node_id")) {
                            obj.insert("node_id".to_string(), id.clone());
                        }
                    }
                    inner
                }
                None => data,
            };
            NodeSnapshot::from_value(node)
                .map(InboundFrame::NodeAdded)
                .ok_or_else(|| malformed("missing numeric node_id"))
        }
        "node_removed" => data
            .as_u64()
            .or_else(|| data.get("node_id").and_then(Value::as_u64))
            .map(|node_id| InboundFrame::NodeRemoved { node_id })
            .ok_or_else(|| malformed("missing numeric node_id")),
        other => Ok(InboundFrame::Unrecognized(format!("event '{other}'"))),
    }
}

fn parse_attribute_update(data: &Value) -> Option<AttributeUpdate> {
    if let Some(items) = data.as_array() {
        if items.len() < 3 {
            return None;
        }
        return Some(AttributeUpdate {
            node_id: items[0].as_u64()?,
            path: AttributePath::parse(items[1].as_str()?)?,
            value: items[2].clone(),
        });
    }

    Some(AttributeUpdate {
        node_id: data.get("node_id")?.as_u64()?,
        path: AttributePath::from_object(data.get("attribute_path")?)?,
        value: data.get("value").cloned().unwrap_or(Value::Null),
    })
}

fn message_id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn error_text(frame: &Value) -> Option<String> {
    if let Some(error) = frame.get("error").filter(|e| !e.is_null()) {
        return Some(match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    frame.get("error_code").map(|code| {
        let details = frame
            .get("details")
            .and_then(Value::as_str)
            .unwrap_or("no details");
        format!("error_code {code}: {details}")
    })
}

fn summarize(frame: &Value) -> String {
    match frame.as_object() {
        Some(obj) => {
            let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
            format!("frame with keys [{}]", keys.join(", "))
        }
        None => "non-object frame".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_nodes_frame_has_no_args() {
        let frame = Request::GetNodes.to_frame(1).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"message_id": "1", "command": "get_nodes"}));
    }

    #[test]
    fn test_send_command_frame() {
        let request = Request::SendCommand(DeviceCommand {
            node_id: 12,
            endpoint_id: 1,
            cluster_id: 6,
            command_id: 1,
            command_name: "On".to_string(),
            payload: Map::new(),
        });
        let value: Value = serde_json::from_str(&request.to_frame(42).unwrap()).unwrap();

        assert_eq!(value["message_id"], "42");
        assert_eq!(value["command"], "device.send_command");
        assert_eq!(value["args"]["node_id"], 12);
        assert_eq!(value["args"]["endpoint_id"], 1);
        assert_eq!(value["args"]["cluster_id"], 6);
        assert_eq!(value["args"]["command_name"], "On");
        assert_eq!(value["args"]["payload"], json!({}));
    }

    #[test]
    fn test_attribute_path_parse() {
        assert_eq!(
            AttributePath::parse("1/1026/0"),
            Some(AttributePath::new(1, 0x0402, 0))
        );
        assert_eq!(AttributePath::parse("1/1026"), None);
        assert_eq!(AttributePath::parse("1/1026/0/5"), None);
        assert_eq!(AttributePath::parse("a/b/c"), None);
    }

    #[test]
    fn test_attribute_path_from_incomplete_object() {
        let incomplete = json!({"endpoint_id": 1, "cluster_id": 6});
        assert_eq!(AttributePath::from_object(&incomplete), None);
    }

    #[test]
    fn test_parse_list_attribute_update() {
        let frame = json!({"event": "attribute_updated", "data": [5, "1/1026/0", 2150]});
        let parsed = parse_frame(&frame.to_string()).unwrap();
        assert_eq!(
            parsed,
            InboundFrame::AttributeUpdated(AttributeUpdate {
                node_id: 5,
                path: AttributePath::new(1, 0x0402, 0),
                value: json!(2150),
            })
        );
    }

    #[test]
    fn test_parse_dict_attribute_update() {
        let frame = json!({
            "event": "attribute_updated",
            "data": {
                "node_id": 9,
                "attribute_path": {"endpoint_id": 1, "cluster_id": 6, "attribute_id": 0},
                "value": true
            }
        });
        match parse_frame(&frame.to_string()).unwrap() {
            InboundFrame::AttributeUpdated(update) => {
                assert_eq!(update.node_id, 9);
                assert_eq!(update.path, AttributePath::new(1, 6, 0));
                assert_eq!(update.value, json!(true));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_attribute_update_is_malformed() {
        let frame = json!({"event": "attribute_updated", "data": [5, "1/1026", 2150]});
        assert!(matches!(
            parse_frame(&frame.to_string()),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn test_parse_node_added_wrapped_and_inline() {
        let wrapped = json!({
            "event": "node_added",
            "data": {"node_id": 4, "node": {"attributes": {"1/6/0": true}}}
        });
        match parse_frame(&wrapped.to_string()).unwrap() {
            InboundFrame::NodeAdded(node) => {
                assert_eq!(node.node_id, 4);
                assert_eq!(node.attributes, vec![(AttributePath::new(1, 6, 0), json!(true))]);
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let inline = json!({"event": "node_added", "data": {"node_id": 8, "available": true}});
        assert!(matches!(
            parse_frame(&inline.to_string()).unwrap(),
            InboundFrame::NodeAdded(NodeSnapshot { node_id: 8, .. })
        ));
    }

    #[test]
    fn test_parse_node_removed_forms() {
        for data in [json!(7), json!({"node_id": 7})] {
            let frame = json!({"event": "node_removed", "data": data});
            assert_eq!(
                parse_frame(&frame.to_string()).unwrap(),
                InboundFrame::NodeRemoved { node_id: 7 }
            );
        }
    }

    #[test]
    fn test_parse_responses() {
        let ok = json!({"message_id": "3", "result": [{"node_id": 1}]});
        assert_eq!(
            parse_frame(&ok.to_string()).unwrap(),
            InboundFrame::Response {
                message_id: "3".to_string(),
                result: json!([{"node_id": 1}]),
            }
        );

        let err = json!({"message_id": "4", "error_code": 5, "details": "node not found"});
        match parse_frame(&err.to_string()).unwrap() {
            InboundFrame::ErrorResponse { message_id, error } => {
                assert_eq!(message_id, "4");
                assert!(error.contains("node not found"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_server_info_is_unrecognized() {
        let info = json!({"fabric_id": 1, "schema_version": 11, "sdk_version": "2024.1"});
        assert!(matches!(
            parse_frame(&info.to_string()).unwrap(),
            InboundFrame::Unrecognized(_)
        ));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(parse_frame("{not json"), Err(FrameError::Json(_))));
    }

    #[test]
    fn test_node_snapshot_skips_malformed_attribute_keys() {
        let node = NodeSnapshot::from_value(json!({
            "node_id": 2,
            "attributes": {"1/1026/0": 2000, "garbage": 1, "0/40": "x"}
        }))
        .unwrap();
        assert_eq!(node.attributes.len(), 1);
    }
}
