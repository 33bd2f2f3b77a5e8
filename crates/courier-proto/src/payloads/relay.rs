//! Message relay payloads.
//!
//! The relay forwards ciphertext it cannot read. Outbound [`Data`] frames
//! name a recipient; the relay turns each into an [`Envelope`] for that
//! recipient and redelivers it on every connection until the recipient sends
//! an [`Ack`] for its id.

use serde::{Deserialize, Serialize};

/// How a ciphertext must be decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiphertextKind {
    /// Carries the sender's identity and ephemeral key material. Sent until
    /// the sender has received any reply over the session.
    Initial,
    /// Ratchet-only message over an established session.
    Established,
}

/// Client to relay: ciphertext for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    /// Client-chosen id, echoed in the relay's [`Ack`]
    pub message_id: String,
    /// Recipient account id
    pub recipient_id: String,
    /// Ciphertext kind
    pub kind: CiphertextKind,
    /// Opaque ciphertext
    pub ciphertext: Vec<u8>,
    /// Sender wall-clock time, Unix milliseconds
    pub timestamp: u64,
}

/// Relay to client: one delivered ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Relay-assigned envelope id
    pub id: String,
    /// Sender account id
    pub source_id: String,
    /// Ciphertext kind
    pub kind: CiphertextKind,
    /// Opaque ciphertext
    pub ciphertext: Vec<u8>,
    /// Sender wall-clock time, Unix milliseconds
    pub timestamp: u64,
}

/// Acknowledgment.
///
/// Client to relay, `id` is an [`Envelope::id`]. Relay to client, `id` is a
/// [`Data::message_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Acknowledged id
    pub id: String,
}
