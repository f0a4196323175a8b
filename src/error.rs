//! Error types
//!
//! Each component owns one error enum. Denials (bad credentials, topic ACL,
//! session authorization) are per-connection outcomes and never abort the
//! process; only listener failures surface as infrastructure errors.

use thiserror::Error;

/// Identifier validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("MAC address must be 12 characters, got {0}")]
    MacLength(usize),
    #[error("MAC address contains invalid character: {0}")]
    MacCharacter(char),
    #[error("IMEI must be 14-16 digits, got {0}")]
    ImeiLength(usize),
    #[error("IMEI contains invalid character: {0}")]
    ImeiCharacter(char),
    #[error("identifier kind must be 'mac' or 'imei', got '{0}'")]
    UnknownKind(String),
}

/// MQTT stream framing failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },
    #[error("malformed remaining length")]
    MalformedLength,
    #[error("unsupported protocol {name} level {level}")]
    UnsupportedProtocol { name: String, level: u8 },
    #[error("failed to decode MQTT packet: {0}")]
    Decode(String),
    #[error("failed to encode MQTT packet: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Device broker failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Publish/subscribe/kick before start or after stop. Retry after restart.
    #[error("MQTT broker not running")]
    NotRunning,
    /// Listener could not be bound. Fatal to the broker run loop.
    #[error("failed to bind MQTT listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("MQTT listener failed: {0}")]
    Accept(#[source] std::io::Error),
}

/// Session registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("too many connections for user {user_id} (max {max})")]
    TooManyConnections { user_id: String, max: usize },
    #[error("session hub is shut down")]
    ShuttingDown,
}

impl HubError {
    /// Stable machine-readable code for error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TooManyConnections { .. } => "TOO_MANY_CONNECTIONS",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

/// Per-session protocol failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("message of {size} bytes exceeds maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("outbound queue full, message dropped")]
    QueueFull,
    #[error("connection closed")]
    Closed,
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Device directory / policy collaborator failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("device not found")]
    NotFound,
    #[error("invalid identifier: {0}")]
    Invalid(#[from] IdentityError),
    #[error("registration disabled or no default project configured")]
    RegistrationUnavailable,
    #[error("directory backend error: {0}")]
    Backend(String),
}

/// Bearer token verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authentication required")]
    MissingToken,
    #[error("no verification key configured")]
    NotConfigured,
    #[error("invalid verification key: {0}")]
    InvalidKey(String),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token has no subject")]
    MissingSubject,
}

/// Rejections of a WebSocket upgrade request, before the protocol switch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    #[error("authentication failed: {0}")]
    Unauthorized(#[source] AuthError),
    #[error("deviceId parameter required")]
    MissingDeviceId,
    #[error("by parameter must be 'imei' or 'mac'")]
    InvalidKind,
    #[error("invalid device ID format: {0}")]
    InvalidDeviceId(#[source] IdentityError),
    #[error("device not found")]
    DeviceNotFound,
    #[error("failed to verify device: {0}")]
    Lookup(#[source] DirectoryError),
    #[error("permission check failed: {0}")]
    PolicyCheck(#[source] DirectoryError),
    #[error("access denied to device")]
    Forbidden,
}
