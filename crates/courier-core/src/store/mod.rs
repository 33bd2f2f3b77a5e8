//! Device-local key storage.
//!
//! [`KeyStore`] is a plain keyed-record store: opaque byte values grouped by
//! [`Category`], no protocol logic. [`Keyring`] layers typed access on top
//! (CBOR-encoded records, trust-on-first-use bookkeeping).
//!
//! The trait is synchronous. Reads may run concurrently; writes to the same
//! key are last-writer-wins, and the session layer serializes writers per
//! peer above it.

mod keyring;
mod memory;

use std::fmt;

pub use keyring::{Keyring, TrustDecision, TrustRecord};
pub use memory::MemoryKeyStore;

use crate::error::StoreError;

/// Record categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Local identity key pair (single record)
    Identity,
    /// Local registration id (single record)
    RegistrationId,
    /// One-time pre-keys, keyed by decimal id
    PreKeys,
    /// Signed pre-keys, keyed by decimal id
    SignedPreKeys,
    /// Trust-on-first-use records, keyed by peer id
    TrustedIdentities,
    /// Session records, keyed by peer address
    Sessions,
}

impl Category {
    /// Every category, in wipe order.
    pub const ALL: [Self; 6] = [
        Self::Sessions,
        Self::TrustedIdentities,
        Self::PreKeys,
        Self::SignedPreKeys,
        Self::RegistrationId,
        Self::Identity,
    ];

    /// Stable name, used as a table or key prefix by persistent backends.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::RegistrationId => "registration_id",
            Self::PreKeys => "pre_keys",
            Self::SignedPreKeys => "signed_pre_keys",
            Self::TrustedIdentities => "trusted_identities",
            Self::Sessions => "sessions",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyed-record store shared across the process.
///
/// Must be Clone (handed to every component), Send + Sync, and synchronous.
/// Implementations share internal state, so clones see the same records.
pub trait KeyStore: Clone + Send + Sync + 'static {
    /// Value stored under `key`, if any.
    fn get(&self, category: Category, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, category: Category, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove `key`. Returns whether it existed.
    fn delete(&self, category: Category, key: &str) -> Result<bool, StoreError>;

    /// Number of records in `category`.
    fn count(&self, category: Category) -> Result<usize, StoreError>;

    /// Largest key in `category` that parses as a `u32`.
    fn max_numeric_key(&self, category: Category) -> Result<Option<u32>, StoreError>;

    /// Remove every record in `category`.
    fn clear(&self, category: Category) -> Result<(), StoreError>;
}
