//! MQTT protocol handling module
//!
//! Provides packet parsing, stream framing and the device topic contract for
//! the device broker.

mod codec;
mod parser;
mod topic;

pub use codec::{encode_packet, frame_length, BrokerPacket, ConnackCode, MqttCodec};
pub use parser::{
    parse_packet, MqttPacket, MqttPacketType, ParsedConnect, ParsedPublish, ParsedSubscribe,
    ParsedUnsubscribe, Subscription,
};
pub use topic::{device_topic, is_valid_topic, parse_topic, DeviceTopic, TopicKind, TOPIC_ROOT};
