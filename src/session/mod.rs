//! WebSocket sessions bound to devices

mod connection;
mod hub;
mod message;

pub use connection::{SessionConnection, SessionOptions};
pub use hub::{HubStats, SessionHub};
pub use message::{
    codes, command_payload, decode_payload, ClientMessage, ErrorBody, FrameKind, ServerFrame,
};
