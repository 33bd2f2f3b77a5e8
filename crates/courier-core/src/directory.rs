//! Key-bundle directory and outbound delivery seams.
//!
//! Both are served by the relay in production. They are traits so the
//! session layer never depends on the transport crate and tests can use
//! in-memory versions.

use async_trait::async_trait;
use courier_proto::payloads::{
    keys::{KeyBundleData, KeyBundlePublish},
    relay::CiphertextKind,
};

use crate::error::{DeliveryError, DirectoryError};

/// The relay's key-bundle registry.
#[async_trait]
pub trait KeyDirectory: Send + Sync + 'static {
    /// Fetch `peer`'s published bundle.
    ///
    /// The registry hands out each one-time pre-key at most once.
    async fn fetch_key_bundle(&self, peer: &str) -> Result<KeyBundleData, DirectoryError>;

    /// Publish key material for this account. Returns the number of one-time
    /// pre-keys the registry now holds for us.
    async fn publish_key_bundle(&self, bundle: KeyBundlePublish) -> Result<u32, DirectoryError>;
}

/// Encrypted message ready for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext {
    /// Initial (session-establishing) or established
    pub kind: CiphertextKind,
    /// Opaque body
    pub body: Vec<u8>,
}

/// Hands ciphertexts to the relay.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Send `ciphertext` to `peer`. Returns the client message id.
    async fn deliver(&self, peer: &str, ciphertext: Ciphertext) -> Result<String, DeliveryError>;
}
