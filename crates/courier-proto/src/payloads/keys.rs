//! Key-bundle registry payloads.
//!
//! Key material travels as raw byte vectors here. Length and signature
//! checks happen once, where the crypto layer converts these into typed keys.

use serde::{Deserialize, Serialize};

/// Public half of a one-time pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyData {
    /// Pre-key id, unique per device
    pub key_id: u32,
    /// X25519 public key (32 bytes)
    pub public_key: Vec<u8>,
}

/// Public half of a signed pre-key with its identity signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyData {
    /// Signed pre-key id (strictly increasing per device)
    pub key_id: u32,
    /// X25519 public key (32 bytes)
    pub public_key: Vec<u8>,
    /// Ed25519 signature over `public_key` by the identity key (64 bytes)
    pub signature: Vec<u8>,
}

/// Everything needed to open a session with a user who may be offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundleData {
    /// Public identity key (64 bytes: Ed25519 verifying key, X25519 key)
    pub identity_key: Vec<u8>,
    /// Device registration id
    pub registration_id: u32,
    /// Active signed pre-key
    pub signed_pre_key: SignedPreKeyData,
    /// One-time pre-key, absent when the owner's supply is exhausted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<PreKeyData>,
}

/// Client to relay: publish key material for this account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundlePublish {
    /// Public identity key
    pub identity_key: Vec<u8>,
    /// Device registration id
    pub registration_id: u32,
    /// New active signed pre-key
    pub signed_pre_key: SignedPreKeyData,
    /// Additional one-time pre-keys
    pub one_time_pre_keys: Vec<PreKeyData>,
}

/// Relay to client: publish accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundlePublished {
    /// One-time pre-keys now held by the relay for this account
    pub available: u32,
}

/// Client to relay: fetch a user's bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundleFetch {
    /// Account whose bundle is requested
    pub user_id: String,
}

/// Relay to client: fetched bundle.
///
/// The relay hands out each one-time pre-key at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundleReply {
    /// Account the bundle belongs to
    pub user_id: String,
    /// Bundle, `None` if the account never published one
    pub bundle: Option<KeyBundleData>,
}
