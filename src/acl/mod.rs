//! Access Control List (ACL) module
//!
//! Enforces the device topic contract on every PUBLISH and SUBSCRIBE a device
//! client sends.

mod evaluator;
mod rules;

pub use evaluator::{TopicAcl, MAX_DOWNLINK_QOS};
pub use rules::{AclDecision, AclRequest, MqttAction};
