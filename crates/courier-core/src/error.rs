//! Error types for the session core.
//!
//! One enum per component. Cryptographic validation failures are never
//! folded into generic variants: callers decide recovery policy from the
//! variant alone.

use courier_crypto::CryptoError;
use thiserror::Error;

use crate::store::Category;

/// Key store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store rejected the operation
    #[error("store backend error: {0}")]
    Backend(String),

    /// A record exists but cannot be decoded
    #[error("corrupt {category} record {key}: {reason}")]
    Corrupt {
        /// Record category
        category: Category,
        /// Record key
        key: String,
        /// Decode failure
        reason: String,
    },

    /// A record could not be encoded
    #[error("failed to encode {category} record: {reason}")]
    Encode {
        /// Record category
        category: Category,
        /// Encode failure
        reason: String,
    },
}

/// Key-bundle directory failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The peer never published a bundle
    #[error("no key bundle published for {peer}")]
    NotFound {
        /// Peer id
        peer: String,
    },

    /// Relay could not be reached
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    /// Relay answered with an error
    #[error("directory rejected request ({code}): {message}")]
    Rejected {
        /// Relay error code
        code: u16,
        /// Relay message
        message: String,
    },

    /// No answer in time
    #[error("directory request timed out")]
    Timeout,
}

impl DirectoryError {
    /// Returns true if a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Outbound delivery failure reported by a [`MessageSink`](crate::MessageSink).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("delivery failed: {reason}")]
pub struct DeliveryError {
    /// Why the message could not be handed to the relay
    pub reason: String,
}

/// Session layer failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// This device has no identity yet
    #[error("local identity not registered")]
    NotRegistered,

    /// Peer bundle could not be fetched
    #[error("peer {peer} unreachable: {source}")]
    PeerUnreachable {
        /// Peer id
        peer: String,
        /// Directory failure
        source: DirectoryError,
    },

    /// Peer bundle failed validation
    #[error("invalid key bundle from {peer}: {reason}")]
    InvalidBundle {
        /// Peer id
        peer: String,
        /// Validation failure
        reason: String,
    },

    /// Bundle carried no one-time pre-key and strict mode is on
    #[error("no one-time pre-key available for {peer}")]
    NoPreKeyAvailable {
        /// Peer id
        peer: String,
    },

    /// Peer presented an identity key different from the trusted one
    #[error("identity key for {peer} does not match trusted key")]
    IdentityMismatch {
        /// Peer id
        peer: String,
    },

    /// Message could not be decrypted
    #[error("decryption from {peer} failed: {reason}")]
    DecryptionFailed {
        /// Peer id
        peer: String,
        /// Underlying failure
        reason: String,
    },

    /// Local cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Key store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Whether this failure should start session recovery with the peer.
    ///
    /// Recovery is for desynchronized sessions. Local storage problems and
    /// unreachable peers are not fixed by a reset, and an identity mismatch
    /// needs the user's decision: a reset would trust the new key.
    pub fn triggers_recovery(&self) -> bool {
        matches!(self, Self::DecryptionFailed { .. })
    }

    /// Returns true if a retry may succeed without any state change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PeerUnreachable { source, .. } if source.is_transient())
    }
}

/// Pre-key supply failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreKeyError {
    /// Replenishment requires a registered identity
    #[error("local identity not registered")]
    NotRegistered,

    /// Publishing to the directory failed. New keys were rolled back
    /// unless the failure is transient
    #[error("publish failed: {0}")]
    Publish(#[from] DirectoryError),

    /// Key store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PreKeyError {
    /// Returns true if a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Publish(e) if e.is_transient())
    }
}

/// Session recovery failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    /// Rebuilding the session failed
    #[error("session rebuild failed: {0}")]
    Session(#[from] SessionError),

    /// The reset notice could not be sent
    #[error("reset notice not delivered: {0}")]
    Delivery(#[from] DeliveryError),

    /// The reset notice could not be encoded
    #[error("reset notice encoding failed: {0}")]
    Encoding(String),

    /// Contact book failure
    #[error("contact repair failed: {0}")]
    Contacts(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desync_triggers_recovery() {
        let err = SessionError::DecryptionFailed {
            peer: "bob".to_string(),
            reason: "authentication failed".to_string(),
        };
        assert!(err.triggers_recovery());
    }

    #[test]
    fn identity_mismatch_is_left_to_the_user() {
        assert!(!SessionError::IdentityMismatch { peer: "bob".to_string() }.triggers_recovery());
    }

    #[test]
    fn local_failures_do_not_trigger_recovery() {
        assert!(!SessionError::NotRegistered.triggers_recovery());
        assert!(
            !SessionError::Store(StoreError::Backend("disk full".to_string())).triggers_recovery()
        );
        assert!(
            !SessionError::InvalidBundle { peer: "bob".to_string(), reason: "sig".to_string() }
                .triggers_recovery()
        );
    }

    #[test]
    fn unreachable_peer_is_transient_only_for_network_failures() {
        let timeout = SessionError::PeerUnreachable {
            peer: "bob".to_string(),
            source: DirectoryError::Timeout,
        };
        let missing = SessionError::PeerUnreachable {
            peer: "bob".to_string(),
            source: DirectoryError::NotFound { peer: "bob".to_string() },
        };

        assert!(timeout.is_transient());
        assert!(!missing.is_transient());
    }

    #[test]
    fn publish_timeout_is_transient() {
        assert!(PreKeyError::Publish(DirectoryError::Timeout).is_transient());
        assert!(!PreKeyError::NotRegistered.is_transient());
    }
}
