//! Courier Session Core
//!
//! Secure-session management between this device and its peers, on top of
//! a [`CryptoEngine`](courier_crypto::CryptoEngine):
//!
//! - [`SessionLayer`]: one session per peer, established lazily from the
//!   peer's published key bundle; encrypt and decrypt
//! - [`PreKeySupplyManager`]: registration and one-time pre-key
//!   replenishment
//! - [`SessionRecoveryCoordinator`]: rebuilds desynchronized sessions with
//!   cooldown, dedup and per-envelope guards
//! - [`store`]: the keyed-record store everything above persists into
//!
//! The network is reached only through the [`KeyDirectory`] and
//! [`MessageSink`] seams, and time and randomness only through
//! [`Environment`], so every component here runs unchanged under a
//! simulated relay and clock.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod contacts;
pub mod directory;
pub mod env;
pub mod error;
pub mod expiring;
pub mod prekeys;
pub mod recovery;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{PreKeyConfig, RecoveryConfig, SessionConfig};
pub use contacts::{Contact, ContactBook, ContactStatus, MemoryContactBook};
pub use directory::{Ciphertext, KeyDirectory, MessageSink};
pub use env::Environment;
pub use error::{DeliveryError, DirectoryError, PreKeyError, RecoveryError, SessionError, StoreError};
pub use prekeys::{PreKeyStatus, PreKeySupplyManager, Registration, Replenishment};
pub use recovery::{ResetPhase, SessionRecoveryCoordinator};
pub use session::{SessionHandle, SessionLayer};
pub use store::{Category, KeyStore, Keyring, MemoryKeyStore, TrustDecision, TrustRecord};
