//! MQTT packet parsing
//!
//! Wraps the mqttrs crate and copies the borrowed packet fields into owned
//! structures the broker can hold across await points.

use crate::error::CodecError;
use mqttrs::{decode_slice, Packet, Protocol, QoS};

/// Parsed MQTT packet received from a device client
#[derive(Debug, Clone)]
pub enum MqttPacket {
    Connect(ParsedConnect),
    Publish(ParsedPublish),
    Subscribe(ParsedSubscribe),
    Unsubscribe(ParsedUnsubscribe),
    Puback(u16),
    Pubrec(u16),
    Pubrel(u16),
    Pubcomp(u16),
    PingReq,
    PingResp,
    Disconnect,
    Other(MqttPacketType),
}

impl MqttPacket {
    pub fn packet_type(&self) -> MqttPacketType {
        match self {
            Self::Connect(_) => MqttPacketType::Connect,
            Self::Publish(_) => MqttPacketType::Publish,
            Self::Subscribe(_) => MqttPacketType::Subscribe,
            Self::Unsubscribe(_) => MqttPacketType::Unsubscribe,
            Self::Puback(_) => MqttPacketType::Puback,
            Self::Pubrec(_) => MqttPacketType::Pubrec,
            Self::Pubrel(_) => MqttPacketType::Pubrel,
            Self::Pubcomp(_) => MqttPacketType::Pubcomp,
            Self::PingReq => MqttPacketType::Pingreq,
            Self::PingResp => MqttPacketType::Pingresp,
            Self::Disconnect => MqttPacketType::Disconnect,
            Self::Other(kind) => *kind,
        }
    }
}

/// MQTT packet type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttPacketType {
    Connect,
    Connack,
    Publish,
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Subscribe,
    Suback,
    Unsubscribe,
    Unsuback,
    Pingreq,
    Pingresp,
    Disconnect,
}

impl MqttPacketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connack => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::Puback => "PUBACK",
            Self::Pubrec => "PUBREC",
            Self::Pubrel => "PUBREL",
            Self::Pubcomp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::Suback => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Unsuback => "UNSUBACK",
            Self::Pingreq => "PINGREQ",
            Self::Pingresp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

/// Parsed CONNECT packet
#[derive(Debug, Clone)]
pub struct ParsedConnect {
    /// Protocol version (3 = 3.1, 4 = 3.1.1)
    pub protocol_version: u8,
    /// Client identifier (may be empty)
    pub client_id: String,
    /// Clean session flag
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Username if provided
    pub username: Option<String>,
    /// Password if provided (devices send their raw hardware address)
    pub password: Option<Vec<u8>>,
}

/// Parsed PUBLISH packet
#[derive(Debug, Clone)]
pub struct ParsedPublish {
    /// Topic name
    pub topic: String,
    /// Message payload
    pub payload: Vec<u8>,
    /// QoS level (0, 1, or 2)
    pub qos: u8,
    /// Retain flag
    pub retain: bool,
    /// Duplicate delivery flag
    pub dup: bool,
    /// Packet identifier (for QoS > 0)
    pub packet_id: Option<u16>,
}

/// Parsed SUBSCRIBE packet
#[derive(Debug, Clone)]
pub struct ParsedSubscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Topic filters with requested QoS
    pub subscriptions: Vec<Subscription>,
}

/// A single subscription in a SUBSCRIBE packet
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic_filter: String,
    pub qos: u8,
}

/// Parsed UNSUBSCRIBE packet
#[derive(Debug, Clone)]
pub struct ParsedUnsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Parse exactly one complete MQTT packet from `data`.
pub fn parse_packet(data: &[u8]) -> Result<MqttPacket, CodecError> {
    let packet = decode_slice(data)
        .map_err(|e| match e {
            mqttrs::Error::InvalidProtocol(name, level) => CodecError::UnsupportedProtocol {
                name: name.to_string(),
                level,
            },
            other => CodecError::Decode(other.to_string()),
        })?
        .ok_or_else(|| CodecError::Decode("incomplete packet".to_string()))?;

    let parsed = match packet {
        Packet::Connect(connect) => MqttPacket::Connect(ParsedConnect {
            protocol_version: match connect.protocol {
                Protocol::MQTT311 => 4,
                Protocol::MQIsdp => 3,
            },
            client_id: connect.client_id.to_string(),
            clean_session: connect.clean_session,
            keep_alive: connect.keep_alive,
            username: connect.username.map(|s| s.to_string()),
            password: connect.password.map(|p| p.to_vec()),
        }),

        Packet::Publish(publish) => {
            let (qos, packet_id) = match publish.qospid {
                mqttrs::QosPid::AtMostOnce => (0, None),
                mqttrs::QosPid::AtLeastOnce(pid) => (1, Some(pid.get())),
                mqttrs::QosPid::ExactlyOnce(pid) => (2, Some(pid.get())),
            };

            MqttPacket::Publish(ParsedPublish {
                topic: publish.topic_name.to_string(),
                payload: publish.payload.to_vec(),
                qos,
                retain: publish.retain,
                dup: publish.dup,
                packet_id,
            })
        }

        Packet::Subscribe(subscribe) => MqttPacket::Subscribe(ParsedSubscribe {
            packet_id: subscribe.pid.get(),
            subscriptions: subscribe
                .topics
                .iter()
                .map(|t| Subscription {
                    topic_filter: t.topic_path.to_string(),
                    qos: qos_to_u8(t.qos),
                })
                .collect(),
        }),

        Packet::Unsubscribe(unsub) => MqttPacket::Unsubscribe(ParsedUnsubscribe {
            packet_id: unsub.pid.get(),
            topics: unsub.topics.iter().map(|t| t.to_string()).collect(),
        }),

        Packet::Puback(pid) => MqttPacket::Puback(pid.get()),
        Packet::Pubrec(pid) => MqttPacket::Pubrec(pid.get()),
        Packet::Pubrel(pid) => MqttPacket::Pubrel(pid.get()),
        Packet::Pubcomp(pid) => MqttPacket::Pubcomp(pid.get()),
        Packet::Pingreq => MqttPacket::PingReq,
        Packet::Pingresp => MqttPacket::PingResp,
        Packet::Disconnect => MqttPacket::Disconnect,

        // Server-to-client packets a device should never send
        Packet::Connack(_) => MqttPacket::Other(MqttPacketType::Connack),
        Packet::Suback(_) => MqttPacket::Other(MqttPacketType::Suback),
        Packet::Unsuback(_) => MqttPacket::Other(MqttPacketType::Unsuback),
    };

    Ok(parsed)
}

pub(crate) fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

pub(crate) fn u8_to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}
