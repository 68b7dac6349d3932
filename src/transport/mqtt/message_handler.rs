//! Pure classification of rumqttc events
//!
//! The poll loop in [`super::client`] turns every event into an [`EventRoute`]
//! and only then decides what to forward. Keeping the match here makes the
//! packet handling testable without a broker.

use super::connection::from_rumqttc_qos;
use crate::transport::IncomingMessage;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;

/// Pure routing decisions for rumqttc events
pub struct EventClassifier;

impl EventClassifier {
    /// Classify one event from the rumqttc event loop
    pub fn classify(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(packet) => match packet {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(IncomingMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: Bytes::copy_from_slice(&publish.payload),
                    qos: from_rumqttc_qos(publish.qos),
                    retain: publish.retain,
                }),
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("broker sent disconnect: {:?}", disconnect.reason_code))
                }
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    rejected: suback
                        .return_codes
                        .iter()
                        .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                        .count(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Routing decisions for rumqttc events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived(IncomingMessage),
    /// Broker-initiated disconnect
    Disconnected(String),
    SubscriptionAcknowledged { packet_id: u16, rejected: usize },
    /// PingResp, PubAck and similar
    InfrastructureEvent(String),
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QoS;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Publish,
    };

    #[test]
    fn test_classify_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            EventClassifier::classify(&connack),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_classify_broker_disconnect() {
        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::ServerShuttingDown,
            properties: None,
        }));
        match EventClassifier::classify(&disconnect) {
            EventRoute::Disconnected(reason) => assert!(reason.contains("ServerShuttingDown")),
            other => panic!("Expected Disconnected, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("ems/3/devices/9/telemetry"),
            pkid: 1,
            payload: Bytes::from(r#"{"power": 1500}"#),
            properties: None,
        }));

        match EventClassifier::classify(&publish) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.topic, "ems/3/devices/9/telemetry");
                assert_eq!(message.qos, QoS::AtLeastOnce);
                assert!(message.retain);
                assert_eq!(&message.payload[..], br#"{"power": 1500}"#);
            }
            other => panic!("Expected MessageReceived, got {other:?}"),
        }
    }
}
