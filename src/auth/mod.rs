//! Authentication module
//!
//! Device clients authenticate on CONNECT with the shared device username and
//! their raw hardware address as password. Session users authenticate with a
//! bearer token checked by an [`IdentityVerifier`].

mod jwt;

pub use jwt::{Claims, JwtVerifier};

use crate::error::AuthError;
use crate::identity;
use crate::mqtt::ParsedConnect;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result of device authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// Whether authentication succeeded
    pub authenticated: bool,
    /// Normalized device key the client is bound to
    pub device_key: Option<String>,
    /// Reason for failure (if not authenticated)
    pub reason: Option<String>,
}

impl AuthResult {
    pub fn success(device_key: String) -> Self {
        Self {
            authenticated: true,
            device_key: Some(device_key),
            reason: None,
        }
    }

    pub fn failure(reason: &str) -> Self {
        Self {
            authenticated: false,
            device_key: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// CONNECT credential check for device clients
#[derive(Debug, Clone)]
pub struct DeviceAuthenticator {
    device_username: String,
}

impl DeviceAuthenticator {
    pub fn new(device_username: impl Into<String>) -> Self {
        Self {
            device_username: device_username.into(),
        }
    }

    pub fn device_username(&self) -> &str {
        &self.device_username
    }

    /// Authenticate a CONNECT packet
    pub fn authenticate(&self, connect: &ParsedConnect) -> AuthResult {
        if connect.username.as_deref() != Some(self.device_username.as_str()) {
            return AuthResult::failure("Unknown device username");
        }

        let Some(password) = connect.password.as_deref() else {
            return AuthResult::failure("Missing device password");
        };

        let Ok(raw) = std::str::from_utf8(password) else {
            return AuthResult::failure("Password is not valid UTF-8");
        };

        match identity::normalize_mac(raw) {
            Ok(device_key) => {
                debug!(
                    client_id = %connect.client_id,
                    device_id = %device_key,
                    "Device credentials accepted"
                );
                AuthResult::success(device_key)
            }
            Err(e) => {
                debug!(client_id = %connect.client_id, error = %e, "Device password rejected");
                AuthResult::failure("Password is not a hardware address")
            }
        }
    }
}

/// Identity of a session user after token verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub org: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Bypasses domain-scoped policy checks
    #[serde(default)]
    pub is_super_user: bool,
}

/// Bearer token verification
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<VerifiedIdentity, AuthError>;
}
