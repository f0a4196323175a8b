//! Configuration types for the device bridge
//!
//! Provides JSON-serializable configuration for the MQTT device broker, the
//! WebSocket session layer, and session identity verification.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Device Bridge Configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct BridgeConfig {
    /// MQTT device broker
    pub broker: BrokerConfig,

    /// WebSocket sessions and hub limits
    pub websocket: WebSocketConfig,

    /// Bearer token verification
    pub identity: IdentityConfig,

    /// Static authorization grants for the built-in policy
    pub policy: PolicyConfig,

    /// General settings
    pub general: GeneralConfig,
}

// ============================================================================
// Broker Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BrokerConfig {
    /// TCP address the broker listens on
    pub listen_addr: String,

    /// Username every device presents on CONNECT
    pub device_username: String,

    /// Create unknown devices when they publish to their register topic
    pub allow_registration: bool,

    /// Project assigned to self-registered devices
    pub default_project_id: Option<String>,

    /// Seconds a new connection has to send CONNECT
    pub connect_timeout_secs: u64,

    /// Largest accepted MQTT packet in bytes
    pub max_packet_size: usize,

    /// Per-client downlink queue depth
    pub client_queue_size: usize,

    /// Per-subscriber device event queue depth
    pub subscriber_queue_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1883".to_string(),
            device_username: "device".to_string(),
            allow_registration: true,
            default_project_id: None,
            connect_timeout_secs: 30,
            max_packet_size: default_max_packet(),
            client_queue_size: 64,
            subscriber_queue_size: 256,
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ============================================================================
// WebSocket Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WebSocketConfig {
    /// Serve the WebSocket endpoint
    pub enabled: bool,

    /// HTTP address for upgrades, stats and health
    pub listen_addr: String,

    /// Upgrade path
    pub path: String,

    /// Concurrent sessions allowed per user
    pub max_conn_per_user: usize,

    /// Outbound queue depth per session
    pub send_buffer: usize,

    /// Largest accepted inbound frame in bytes
    pub max_message_size: usize,

    /// Seconds between keepalive pings
    pub ping_interval_secs: u64,

    /// Seconds the inbound loop waits for any frame or pong
    pub pong_wait_secs: u64,

    /// Deadline in seconds for a single socket write
    pub write_wait_secs: u64,

    /// Seconds without activity before the reaper evicts a session
    pub max_idle_secs: u64,

    /// Seconds between reaper scans
    pub reap_interval_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:8080".to_string(),
            path: "/ws".to_string(),
            max_conn_per_user: 4,
            send_buffer: 256,
            max_message_size: default_max_message(),
            ping_interval_secs: 54,
            pong_wait_secs: 60,
            write_wait_secs: 10,
            max_idle_secs: 300,
            reap_interval_secs: 30,
        }
    }
}

impl WebSocketConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

// ============================================================================
// Identity Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IdentityConfig {
    /// Shared secret for HS256 tokens
    pub jwt_secret: Option<String>,

    /// PEM public key for RS256 tokens (used when no secret is set)
    pub jwt_public_key_pem: Option<String>,

    /// Expected issuer claim
    pub issuer: Option<String>,

    /// Expected audience claim
    pub audience: Option<String>,

    /// Claim to extract as user id
    #[serde(default = "default_user_claim")]
    pub user_claim: String,

    /// Claim to extract as organization
    #[serde(default = "default_org_claim")]
    pub org_claim: String,

    /// Organization whose members are super users
    #[serde(default = "default_super_org")]
    pub super_org: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_public_key_pem: None,
            issuer: None,
            audience: None,
            user_claim: default_user_claim(),
            org_claim: default_org_claim(),
            super_org: default_super_org(),
        }
    }
}

// ============================================================================
// Policy Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct PolicyConfig {
    /// Grants evaluated in order, `*` matches any value
    pub grants: Vec<PolicyGrant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyGrant {
    /// User id
    pub subject: String,
    /// `org:<id>`, `project:<id>`, `partition:<id>` or `device:<id>`
    pub domain: String,
    #[serde(default = "default_wildcard")]
    pub object: String,
    #[serde(default = "default_wildcard")]
    pub action: String,
}

// ============================================================================
// General Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct GeneralConfig {
    /// Log all MQTT packets (verbose)
    pub log_packets: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_max_packet() -> usize {
    256 * 1024 // 256KB
}

fn default_max_message() -> usize {
    512 * 1024 // 512KB
}

fn default_wildcard() -> String {
    "*".to_string()
}

fn default_user_claim() -> String {
    "sub".to_string()
}

fn default_org_claim() -> String {
    "owner".to_string()
}

fn default_super_org() -> String {
    "built-in".to_string()
}
