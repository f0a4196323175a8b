//! Device topic ACL evaluation

use crate::mqtt::{device_topic, is_valid_topic, DeviceTopic, TopicKind};
use tracing::debug;

use super::rules::{AclDecision, AclRequest, MqttAction};

/// Highest QoS granted to a device subscription on its down topic
pub const MAX_DOWNLINK_QOS: u8 = 1;

/// ACL evaluator for the fixed per-device topic contract.
///
/// A device may publish only to `devices/<own-key>/{up,status,register}` and
/// subscribe only to exactly `devices/<own-key>/down`. No wildcards.
#[derive(Debug, Clone, Default)]
pub struct TopicAcl;

impl TopicAcl {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate an ACL request
    pub fn evaluate(&self, request: &AclRequest<'_>) -> AclDecision {
        let decision = match request.action {
            MqttAction::Publish => self.check_publish(request.device_key, request.topic),
            MqttAction::Subscribe => self.check_subscribe(request.device_key, request.topic),
        };

        debug!(
            device_id = %request.device_key,
            topic = %request.topic,
            action = ?request.action,
            allowed = decision.allowed,
            "ACL evaluated"
        );

        decision
    }

    fn check_publish(&self, device_key: &str, topic: &str) -> AclDecision {
        if !is_valid_topic(topic) {
            return AclDecision::deny("Invalid topic name");
        }

        let Some(parsed) = DeviceTopic::parse(topic) else {
            return AclDecision::deny("Topic outside devices/<id>/<kind>");
        };

        if !parsed.kind.is_uplink() {
            return AclDecision::deny(format!("Devices may not publish to '{}'", parsed.kind));
        }

        if device_key.is_empty() || parsed.device_key != device_key {
            return AclDecision::deny("Topic belongs to another device");
        }

        AclDecision::allow(2)
    }

    fn check_subscribe(&self, device_key: &str, filter: &str) -> AclDecision {
        if device_key.is_empty() || filter != device_topic(device_key, TopicKind::Down) {
            return AclDecision::deny("Devices may only subscribe to their own down topic");
        }
        AclDecision::allow(MAX_DOWNLINK_QOS)
    }

    /// Check if a topic can be published to by the device bound to `device_key`
    pub fn can_publish(&self, device_key: &str, topic: &str) -> AclDecision {
        self.evaluate(&AclRequest {
            device_key,
            topic,
            action: MqttAction::Publish,
        })
    }

    /// Check if a topic filter can be subscribed to by the device bound to `device_key`
    pub fn can_subscribe(&self, device_key: &str, topic_filter: &str) -> AclDecision {
        self.evaluate(&AclRequest {
            device_key,
            topic: topic_filter,
            action: MqttAction::Subscribe,
        })
    }
}
