//! Pure routing of rumqttc events and inbound message filtering

use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;
use tracing::debug;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the session
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Broker sent DISCONNECT
    Disconnected,
    /// Subscription acknowledged; reason codes kept for logging
    SubscriptionConfirmed { packet_id: u16, reason_codes: String },
    /// PingResp, PubAck and similar
    InfrastructureEvent(String),
    /// Outgoing packet, nothing to do
    OutgoingEvent,
}

/// Pure event and message handling
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    reason_codes: format!("{:?}", suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Retained messages on command topics are stale commands; skip them
    pub fn should_process_message(topic: &str, retain: bool) -> bool {
        if retain {
            debug!(topic, "Ignoring retained message");
            return false;
        }
        true
    }
}
