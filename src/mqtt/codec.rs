//! MQTT stream framing
//!
//! Splits a TCP byte stream into complete MQTT control packets using the
//! fixed-header remaining-length field, and encodes broker-originated packets.

use super::parser::{parse_packet, u8_to_qos, MqttPacket};
use crate::error::CodecError;
use bytes::{Bytes, BytesMut};
use mqttrs::{
    encode_slice, Connack, ConnectReturnCode, Packet, Pid, Publish, QosPid, Suback,
    SubscribeReturnCodes,
};
use tokio_util::codec::{Decoder, Encoder};

/// Largest fixed header: 1 type byte + 4 remaining-length bytes
const MAX_FIXED_HEADER: usize = 5;

/// CONNACK return codes the broker can answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnackCode {
    Accepted,
    UnacceptableProtocol,
    IdentifierRejected,
    BadUsernamePassword,
}

impl ConnackCode {
    fn to_mqttrs(self) -> ConnectReturnCode {
        match self {
            Self::Accepted => ConnectReturnCode::Accepted,
            Self::UnacceptableProtocol => ConnectReturnCode::RefusedProtocolVersion,
            Self::IdentifierRejected => ConnectReturnCode::RefusedIdentifierRejected,
            Self::BadUsernamePassword => ConnectReturnCode::BadUsernamePassword,
        }
    }
}

/// Packet sent from the broker to a device client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerPacket {
    Connack(ConnackCode),
    Publish {
        topic: String,
        payload: Bytes,
        qos: u8,
        packet_id: Option<u16>,
    },
    Puback(u16),
    Pubrec(u16),
    Pubcomp(u16),
    /// Granted QoS per filter, `None` for a refused filter
    Suback {
        packet_id: u16,
        granted: Vec<Option<u8>>,
    },
    Unsuback(u16),
    Pingresp,
}

impl BrokerPacket {
    fn size_hint(&self) -> usize {
        match self {
            Self::Publish { topic, payload, .. } => {
                MAX_FIXED_HEADER + 2 + topic.len() + 2 + payload.len()
            }
            Self::Suback { granted, .. } => MAX_FIXED_HEADER + 2 + granted.len(),
            _ => MAX_FIXED_HEADER + 4,
        }
    }
}

/// Total length (header + body) of the packet starting at `buf`, if the
/// fixed header is complete.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    let mut multiplier = 1usize;
    let mut remaining = 0usize;

    for (i, byte) in buf.iter().skip(1).take(4).enumerate() {
        remaining += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some(1 + (i + 1) + remaining));
        }
        multiplier *= 128;
    }

    if buf.len() >= MAX_FIXED_HEADER {
        Err(CodecError::MalformedLength)
    } else {
        Ok(None)
    }
}

/// Encode a broker packet into a standalone buffer.
pub fn encode_packet(item: &BrokerPacket) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; item.size_hint()];
    let pid = |id: u16| Pid::try_from(id).map_err(|e| CodecError::Encode(e.to_string()));

    let packet = match item {
        BrokerPacket::Connack(code) => Packet::Connack(Connack {
            session_present: false,
            code: code.to_mqttrs(),
        }),
        BrokerPacket::Publish {
            topic,
            payload,
            qos,
            packet_id,
        } => {
            let qospid = match (*qos, packet_id) {
                (0, _) | (_, None) => QosPid::AtMostOnce,
                (1, Some(id)) => QosPid::AtLeastOnce(pid(*id)?),
                (_, Some(id)) => QosPid::ExactlyOnce(pid(*id)?),
            };
            Packet::Publish(Publish {
                dup: false,
                qospid,
                retain: false,
                topic_name: topic,
                payload,
            })
        }
        BrokerPacket::Puback(id) => Packet::Puback(pid(*id)?),
        BrokerPacket::Pubrec(id) => Packet::Pubrec(pid(*id)?),
        BrokerPacket::Pubcomp(id) => Packet::Pubcomp(pid(*id)?),
        BrokerPacket::Suback { packet_id, granted } => Packet::Suback(Suback {
            pid: pid(*packet_id)?,
            return_codes: granted
                .iter()
                .map(|g| match g {
                    Some(qos) => SubscribeReturnCodes::Success(u8_to_qos(*qos)),
                    None => SubscribeReturnCodes::Failure,
                })
                .collect(),
        }),
        BrokerPacket::Unsuback(id) => Packet::Unsuback(pid(*id)?),
        BrokerPacket::Pingresp => Packet::Pingresp,
    };

    let written =
        encode_slice(&packet, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    buf.truncate(written);
    Ok(buf)
}

/// Framed MQTT codec for device connections
#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Decoder for MqttCodec {
    type Item = MqttPacket;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(len) = frame_length(src)? else {
            return Ok(None);
        };

        if len > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size: len,
                max: self.max_packet_size,
            });
        }

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(len);
        parse_packet(&frame).map(Some)
    }
}

impl Encoder<BrokerPacket> for MqttCodec {
    type Error = CodecError;

    fn encode(&mut self, item: BrokerPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = encode_packet(&item)?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
