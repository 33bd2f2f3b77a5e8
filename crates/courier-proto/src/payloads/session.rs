//! Session control payloads.

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// First frame on every connection: authenticates the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Account identifier the token was issued for
    pub user_id: String,
    /// Bearer credential issued by the account service
    pub auth_token: String,
}

/// Relay accepted the Hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Relay-assigned session identifier, for log correlation
    pub session_id: u64,
}

/// Graceful close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Human-readable reason
    pub reason: String,
}
