//! WebSocket session wire messages
//!
//! Client frames are `{"type", "device_id"?, "data"?, "timestamp"?}`. Server
//! frames always carry the session's bound device id and an RFC 3339 timestamp.

use crate::mqtt::TopicKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable codes carried in `error` frames
pub mod codes {
    pub const INVALID_FORMAT: &str = "INVALID_FORMAT";
    pub const DEVICE_MISMATCH: &str = "DEVICE_MISMATCH";
    pub const INVALID_DATA: &str = "INVALID_DATA";
    pub const MQTT_ERROR: &str = "MQTT_ERROR";
    pub const UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";
    pub const REGISTRATION_FAILED: &str = "REGISTRATION_FAILED";
}

#[derive(Debug, Deserialize)]
struct RawClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "deviceId")]
    device_id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// A decoded client frame
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Forward `data` to the device's down topic
    DeviceCommand {
        device_id: String,
        data: Option<Value>,
    },
    Ping,
    /// Any other `type`
    Unknown(String),
}

impl ClientMessage {
    /// Decode a text frame. Only malformed JSON or a missing `type` fails.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawClientMessage = serde_json::from_str(text)?;
        Ok(match raw.kind.as_str() {
            "device_command" => Self::DeviceCommand {
                device_id: raw.device_id.unwrap_or_default(),
                data: raw.data,
            },
            "ping" => Self::Ping,
            _ => Self::Unknown(raw.kind),
        })
    }
}

/// Server frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Connected,
    DeviceData,
    DeviceStatus,
    DeviceRegister,
    DeviceMessage,
    CommandAck,
    Pong,
    Error,
}

impl FrameKind {
    /// Frame type for a device publish on `topic`, by topic suffix.
    pub fn for_topic(topic: &str) -> Self {
        match topic.rsplit('/').next().and_then(TopicKind::from_suffix) {
            Some(TopicKind::Up) => Self::DeviceData,
            Some(TopicKind::Status) => Self::DeviceStatus,
            Some(TopicKind::Register) => Self::DeviceRegister,
            _ => Self::DeviceMessage,
        }
    }
}

/// Body of an `error` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// A frame sent to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ServerFrame {
    pub fn new(kind: FrameKind, device_id: &str, data: Option<Value>) -> Self {
        Self {
            kind,
            device_id: device_id.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn error(device_id: &str, error: &str, code: &str, details: Option<String>) -> Self {
        let body = ErrorBody {
            error: error.to_string(),
            code: Some(code.to_string()),
            details,
        };
        // ErrorBody only holds strings, so this cannot fail.
        let data = serde_json::to_value(body).ok();
        Self::new(FrameKind::Error, device_id, data)
    }

    pub fn command_ack(device_id: &str) -> Self {
        let data = serde_json::json!({
            "status": "forwarded",
            "timestamp": Utc::now(),
        });
        Self::new(FrameKind::CommandAck, device_id, Some(data))
    }

    pub fn pong(device_id: &str) -> Self {
        let data = serde_json::json!({ "timestamp": Utc::now() });
        Self::new(FrameKind::Pong, device_id, Some(data))
    }

    /// Frame for a device publish: JSON payloads are embedded, anything else
    /// is passed as a (lossy UTF-8) string.
    pub fn device_event(device_id: &str, topic: &str, payload: &[u8]) -> Self {
        Self::new(
            FrameKind::for_topic(topic),
            device_id,
            Some(decode_payload(payload)),
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Device payload as a JSON value, falling back to the raw text.
pub fn decode_payload(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

/// Bytes to publish for a command's `data`: strings go out verbatim,
/// everything else (including a missing value) is JSON encoded.
pub fn command_payload(data: Option<&Value>) -> Result<Vec<u8>, serde_json::Error> {
    match data {
        Some(Value::String(s)) => Ok(s.as_bytes().to_vec()),
        Some(value) => serde_json::to_vec(value),
        None => Ok(b"null".to_vec()),
    }
}
