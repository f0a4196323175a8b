//! MQTT Device Bridge
//!
//! Connects field devices speaking MQTT to interactive WebSocket sessions:
//!
//! - **Device Broker**: authenticates devices by hardware address, enforces
//!   the `devices/<id>/{up,status,register,down}` topic contract, and tracks
//!   online/offline lifecycle in the device directory
//! - **Session Hub**: admits WebSocket sessions per user up to a limit, reaps
//!   idle sessions, and closes everything on shutdown
//! - **Session Connection**: bridges one session to one device, turning
//!   device publishes into JSON frames and client commands into downlink
//!   publishes
//! - **Upgrade Handler**: verifies bearer tokens and domain-scoped read
//!   access before a session is opened
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "broker": {
//!     "listen-addr": "0.0.0.0:1883",
//!     "device-username": "device",
//!     "allow-registration": true,
//!     "default-project-id": "6f1c1f0e-4d4b-4b7e-9c55-1f6a2b3c4d5e"
//!   },
//!   "websocket": {
//!     "listen-addr": "0.0.0.0:8080",
//!     "max-conn-per-user": 4
//!   },
//!   "identity": {
//!     "jwt-secret": "change-me",
//!     "org-claim": "owner"
//!   },
//!   "policy": {
//!     "grants": [
//!       { "subject": "alice", "domain": "org:acme", "object": "devices", "action": "read" }
//!     ]
//!   }
//! }
//! ```

pub mod acl;
pub mod auth;
pub mod broker;
pub mod config;
pub mod directory;
pub mod error;
pub mod identity;
pub mod mqtt;
pub mod session;
pub mod upgrade;

// Re-export main types
pub use broker::{DeviceBroker, DeviceBus, DeviceEvent};
pub use config::BridgeConfig;
pub use session::{SessionConnection, SessionHub};
pub use upgrade::{router, AppState};
