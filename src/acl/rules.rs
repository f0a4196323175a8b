//! ACL request and decision types

use serde::{Deserialize, Serialize};

/// MQTT operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttAction {
    Publish,
    Subscribe,
}

/// ACL evaluation request
#[derive(Debug, Clone)]
pub struct AclRequest<'a> {
    /// Device key the client authenticated as
    pub device_key: &'a str,
    /// Topic name (publish) or filter (subscribe)
    pub topic: &'a str,
    /// Action being performed
    pub action: MqttAction,
}

/// Result of ACL evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclDecision {
    /// Whether access is allowed
    pub allowed: bool,
    /// Maximum granted QoS when allowed
    pub max_qos: Option<u8>,
    /// Reason for the decision
    pub reason: String,
}

impl AclDecision {
    pub fn allow(max_qos: u8) -> Self {
        Self {
            allowed: true,
            max_qos: Some(max_qos),
            reason: "Allowed by device topic contract".to_string(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            max_qos: None,
            reason: reason.into(),
        }
    }

    /// QoS actually granted for a request at `requested`.
    pub fn granted_qos(&self, requested: u8) -> Option<u8> {
        if !self.allowed {
            return None;
        }
        Some(self.max_qos.map_or(requested, |max| requested.min(max)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granted_qos_is_capped() {
        let decision = AclDecision::allow(1);
        assert_eq!(decision.granted_qos(0), Some(0));
        assert_eq!(decision.granted_qos(2), Some(1));
    }

    #[test]
    fn test_denied_grants_nothing() {
        assert_eq!(AclDecision::deny("nope").granted_qos(1), None);
    }
}
