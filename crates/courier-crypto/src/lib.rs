//! Courier Session Cryptography
//!
//! Pairwise end-to-end encryption between two devices. Pure functions with
//! deterministic outputs: callers supply every random byte, so sessions can
//! be replayed exactly in tests.
//!
//! # Key Lifecycle
//!
//! A session starts from a published key bundle. The initiator runs an
//! X3DH-style agreement against the bundle, both sides derive the same root
//! secret, and from it two symmetric chains: one per direction. Every message
//! advances the sender's chain and uses a fresh message key once.
//!
//! ```text
//! Identity key + Signed pre-key + One-time pre-key (optional)
//!        │
//!        ▼
//! X3DH (3 or 4 X25519 agreements) → HKDF → Root secret
//!        │
//!        ▼
//! HKDF → Initiator chain seed, Responder chain seed
//!        │
//!        ▼
//! Symmetric Ratchet → Message Keys
//!        │
//!        ▼
//! AEAD Encryption → Ciphertext
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys are zeroized as soon as the next one is derived
//! - Message keys are used for exactly one operation, then dropped
//! - One-time pre-keys are consumed by exactly one establishment
//!
//! Authenticity:
//! - Signed pre-keys carry an Ed25519 signature by the identity key
//! - AEAD associated data binds each ciphertext to both identities
//! - Failed authentication tag means the message is rejected
//!
//! Replay:
//! - Each generation of a receiving chain decrypts at most once

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod agreement;
pub mod bundle;
pub mod engine;
pub mod error;
pub mod keys;
pub mod message;
pub mod ratchet;
pub mod session;

pub use bundle::KeyBundle;
pub use engine::{CryptoEngine, RatchetEngine};
pub use error::CryptoError;
pub use keys::{
    IdentityKey, IdentityKeyPair, KeyPair, PreKeyRecord, PublicKey, SignedPreKeyRecord,
};
pub use message::{CiphertextMessage, PreKeyMessage, RatchetMessage};
pub use ratchet::{MessageKey, SymmetricRatchet};
pub use session::{SessionRecord, SessionState};
