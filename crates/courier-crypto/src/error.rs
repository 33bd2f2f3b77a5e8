//! Crypto engine errors.

use thiserror::Error;

/// Errors raised by the session cryptography.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length or is not a valid point
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// What was wrong
        reason: String,
    },

    /// Signed pre-key signature does not verify under the identity key
    #[error("signed pre-key signature is invalid")]
    InvalidSignature,

    /// AEAD authentication failed or the message does not belong to this
    /// session
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// What failed
        reason: String,
    },

    /// The message key for this generation was already used or discarded
    #[error("message key for generation {generation} already consumed")]
    DuplicateMessage {
        /// Generation of the replayed message
        generation: u32,
    },

    /// Message is further ahead than the ratchet is willing to skip
    #[error("generation {requested} too far ahead of {current}")]
    TooFarAhead {
        /// Current receiving generation
        current: u32,
        /// Generation in the message
        requested: u32,
    },

    /// Ratchet generation counter exhausted
    #[error("ratchet generation overflow at {current}")]
    GenerationOverflow {
        /// Generation at overflow
        current: u32,
    },

    /// The session record holds no usable state
    #[error("no session state")]
    NoSession,

    /// Ciphertext or state framing failed
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl CryptoError {
    /// Whether this error means the peer's message cannot be decrypted with
    /// our state (as opposed to a local encoding or key problem).
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            Self::DecryptionFailed { .. }
                | Self::DuplicateMessage { .. }
                | Self::TooFarAhead { .. }
                | Self::NoSession
        )
    }
}
