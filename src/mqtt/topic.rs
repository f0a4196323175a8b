//! Device topic contract
//!
//! Every device topic has the shape `devices/<id>/<kind>` where `<kind>` is one
//! of `up`, `status`, `register` (device to server) or `down` (server to
//! device). The `<id>` level is folded through [`identity::normalize`] so
//! separator and case variants address the same device.
//!
//! [`identity::normalize`]: crate::identity::normalize

use crate::identity;
use std::fmt;

/// Root level shared by all device topics
pub const TOPIC_ROOT: &str = "devices";

/// Topic suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Telemetry from the device
    Up,
    /// Online/offline status reports
    Status,
    /// Self-registration announcements
    Register,
    /// Commands to the device
    Down,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Status => "status",
            Self::Register => "register",
            Self::Down => "down",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "up" => Some(Self::Up),
            "status" => Some(Self::Status),
            "register" => Some(Self::Register),
            "down" => Some(Self::Down),
            _ => None,
        }
    }

    /// Whether a device may publish on this kind.
    pub fn is_uplink(&self) -> bool {
        !matches!(self, Self::Down)
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A topic that satisfies the device contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic {
    pub device_key: String,
    pub kind: TopicKind,
}

impl DeviceTopic {
    pub fn new(device_key: impl Into<String>, kind: TopicKind) -> Self {
        Self {
            device_key: device_key.into(),
            kind,
        }
    }

    /// Parse a concrete topic name. Returns `None` for anything outside the
    /// contract, including unknown kinds.
    pub fn parse(topic: &str) -> Option<Self> {
        let (key, suffix) = split_device_topic(topic)?;
        let kind = TopicKind::from_suffix(suffix)?;
        Some(Self::new(key, kind))
    }

    pub fn topic(&self) -> String {
        device_topic(&self.device_key, self.kind)
    }
}

fn split_device_topic(topic: &str) -> Option<(String, &str)> {
    let mut levels = topic.split('/');
    let (root, id, suffix) = (levels.next()?, levels.next()?, levels.next()?);
    if levels.next().is_some() || root != TOPIC_ROOT || id.is_empty() {
        return None;
    }
    Some((identity::normalize(id), suffix))
}

/// Split a topic into `(device_key, kind)` strings.
///
/// Any three-level `devices/<id>/<suffix>` topic yields the normalized id and
/// the raw suffix; everything else yields `("", "")`.
pub fn parse_topic(topic: &str) -> (String, String) {
    match split_device_topic(topic) {
        Some((key, suffix)) => (key, suffix.to_string()),
        None => (String::new(), String::new()),
    }
}

/// Build `devices/<key>/<kind>`.
pub fn device_topic(device_key: &str, kind: TopicKind) -> String {
    format!("{}/{}/{}", TOPIC_ROOT, device_key, kind.as_str())
}

/// Check if a topic name is usable in a PUBLISH (no wildcards, no empty levels)
pub fn is_valid_topic(topic: &str) -> bool {
    if topic.is_empty() || topic.contains('+') || topic.contains('#') {
        return false;
    }
    !topic.split('/').any(|level| level.is_empty())
}
