use courier_crypto::{
    IdentityKey, IdentityKeyPair, PreKeyRecord, SessionRecord, SignedPreKeyRecord,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{Category, KeyStore};
use crate::error::StoreError;

/// Key of the single identity and registration-id records.
const LOCAL: &str = "local";

/// Trust-on-first-use record for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    /// Peer id
    pub peer: String,
    /// Identity key first seen for this peer
    pub identity_key: IdentityKey,
    /// Whether the key is trusted
    pub trusted: bool,
    /// First contact, Unix milliseconds
    pub first_seen_ms: u64,
    /// Latest contact with the trusted key, Unix milliseconds
    pub last_seen_ms: u64,
}

/// Outcome of presenting a peer identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// First contact; the key is now trusted
    NewlyTrusted,
    /// Key matches the trusted record
    Trusted,
    /// Key differs from the trusted record, which is left unchanged
    Mismatch,
}

/// Typed access to the key store.
///
/// Records are CBOR-encoded. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct Keyring<S> {
    store: S,
}

impl<S: KeyStore> Keyring<S> {
    /// Wrap a store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Local identity, if registered.
    pub fn identity(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        self.load(Category::Identity, LOCAL)
    }

    /// Store the local identity.
    pub fn put_identity(&self, identity: &IdentityKeyPair) -> Result<(), StoreError> {
        self.save(Category::Identity, LOCAL, identity)
    }

    /// Local registration id, if registered.
    pub fn registration_id(&self) -> Result<Option<u32>, StoreError> {
        self.load(Category::RegistrationId, LOCAL)
    }

    /// Store the local registration id.
    pub fn put_registration_id(&self, id: u32) -> Result<(), StoreError> {
        self.save(Category::RegistrationId, LOCAL, &id)
    }

    /// One-time pre-key `id`.
    pub fn pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
        self.load(Category::PreKeys, &id.to_string())
    }

    /// Store a one-time pre-key.
    pub fn put_pre_key(&self, record: &PreKeyRecord) -> Result<(), StoreError> {
        self.save(Category::PreKeys, &record.id.to_string(), record)
    }

    /// Delete one-time pre-key `id`. Returns whether it existed.
    pub fn remove_pre_key(&self, id: u32) -> Result<bool, StoreError> {
        self.store.delete(Category::PreKeys, &id.to_string())
    }

    /// Number of unconsumed one-time pre-keys.
    pub fn pre_key_count(&self) -> Result<usize, StoreError> {
        self.store.count(Category::PreKeys)
    }

    /// Highest stored one-time pre-key id.
    pub fn max_pre_key_id(&self) -> Result<Option<u32>, StoreError> {
        self.store.max_numeric_key(Category::PreKeys)
    }

    /// Signed pre-key `id`.
    pub fn signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        self.load(Category::SignedPreKeys, &id.to_string())
    }

    /// Store a signed pre-key.
    pub fn put_signed_pre_key(&self, record: &SignedPreKeyRecord) -> Result<(), StoreError> {
        self.save(Category::SignedPreKeys, &record.id.to_string(), record)
    }

    /// Delete signed pre-key `id`.
    pub fn remove_signed_pre_key(&self, id: u32) -> Result<bool, StoreError> {
        self.store.delete(Category::SignedPreKeys, &id.to_string())
    }

    /// Highest signed pre-key id.
    pub fn max_signed_pre_key_id(&self) -> Result<Option<u32>, StoreError> {
        self.store.max_numeric_key(Category::SignedPreKeys)
    }

    /// The active signed pre-key (highest id).
    pub fn active_signed_pre_key(&self) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        match self.max_signed_pre_key_id()? {
            Some(id) => self.signed_pre_key(id),
            None => Ok(None),
        }
    }

    /// Trust record for `peer`.
    pub fn trust(&self, peer: &str) -> Result<Option<TrustRecord>, StoreError> {
        self.load(Category::TrustedIdentities, peer)
    }

    /// Compare `key` against the trust record without writing.
    pub fn check_trust(&self, peer: &str, key: &IdentityKey) -> Result<TrustDecision, StoreError> {
        Ok(match self.trust(peer)? {
            None => TrustDecision::NewlyTrusted,
            Some(record) if record.identity_key == *key => TrustDecision::Trusted,
            Some(_) => TrustDecision::Mismatch,
        })
    }

    /// Record contact with `peer` under `key`.
    ///
    /// First contact creates a trusted record. A matching key refreshes
    /// `last_seen_ms`. A different key is reported as a mismatch and the
    /// existing record is kept as is.
    pub fn save_trust(
        &self,
        peer: &str,
        key: &IdentityKey,
        now_ms: u64,
    ) -> Result<TrustDecision, StoreError> {
        let (record, decision) = match self.trust(peer)? {
            None => (
                TrustRecord {
                    peer: peer.to_string(),
                    identity_key: *key,
                    trusted: true,
                    first_seen_ms: now_ms,
                    last_seen_ms: now_ms,
                },
                TrustDecision::NewlyTrusted,
            ),
            Some(record) if record.identity_key == *key => (
                TrustRecord { last_seen_ms: now_ms.max(record.last_seen_ms), ..record },
                TrustDecision::Trusted,
            ),
            Some(_) => return Ok(TrustDecision::Mismatch),
        };

        self.save(Category::TrustedIdentities, peer, &record)?;
        Ok(decision)
    }

    /// Forget the trust record for `peer`.
    pub fn remove_trust(&self, peer: &str) -> Result<bool, StoreError> {
        self.store.delete(Category::TrustedIdentities, peer)
    }

    /// Session record stored under `address`.
    pub fn session(&self, address: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.load(Category::Sessions, address)
    }

    /// Store a session record.
    pub fn put_session(&self, address: &str, record: &SessionRecord) -> Result<(), StoreError> {
        self.save(Category::Sessions, address, record)
    }

    /// Delete a session record.
    pub fn remove_session(&self, address: &str) -> Result<bool, StoreError> {
        self.store.delete(Category::Sessions, address)
    }

    /// Remove every record in every category.
    pub fn wipe(&self) -> Result<(), StoreError> {
        for category in Category::ALL {
            self.store.clear(category)?;
        }
        Ok(())
    }

    fn load<T: DeserializeOwned>(
        &self,
        category: Category,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let Some(bytes) = self.store.get(category, key)? else {
            return Ok(None);
        };
        ciborium::de::from_reader(bytes.as_slice()).map(Some).map_err(|e| StoreError::Corrupt {
            category,
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn save<T: Serialize>(&self, category: Category, key: &str, value: &T) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Encode { category, reason: e.to_string() })?;
        self.store.put(category, key, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyStore;

    fn keyring() -> Keyring<MemoryKeyStore> {
        Keyring::new(MemoryKeyStore::new())
    }

    fn key(seed: u8) -> IdentityKey {
        IdentityKeyPair::from_seeds([seed; 32], [seed + 1; 32]).public()
    }

    #[test]
    fn first_contact_is_trusted() {
        let ring = keyring();

        assert_eq!(ring.save_trust("bob", &key(1), 100).unwrap(), TrustDecision::NewlyTrusted);
        assert_eq!(ring.save_trust("bob", &key(1), 200).unwrap(), TrustDecision::Trusted);

        let record = ring.trust("bob").unwrap().unwrap();
        assert_eq!((record.first_seen_ms, record.last_seen_ms), (100, 200));
    }

    #[test]
    fn mismatch_never_overwrites() {
        let ring = keyring();
        ring.save_trust("bob", &key(1), 100).unwrap();

        assert_eq!(ring.save_trust("bob", &key(5), 300).unwrap(), TrustDecision::Mismatch);
        assert_eq!(ring.check_trust("bob", &key(5)).unwrap(), TrustDecision::Mismatch);

        let record = ring.trust("bob").unwrap().unwrap();
        assert_eq!(record.identity_key, key(1));
        assert_eq!(record.last_seen_ms, 100);
    }

    #[test]
    fn removing_trust_allows_new_key() {
        let ring = keyring();
        ring.save_trust("bob", &key(1), 100).unwrap();
        ring.remove_trust("bob").unwrap();

        assert_eq!(ring.save_trust("bob", &key(5), 300).unwrap(), TrustDecision::NewlyTrusted);
    }

    #[test]
    fn active_signed_pre_key_is_highest_id() {
        let ring = keyring();
        let identity = IdentityKeyPair::from_seeds([1; 32], [2; 32]);
        for id in [1, 3, 2] {
            ring.put_signed_pre_key(&SignedPreKeyRecord::generate(id, &identity, [id as u8; 32], 0))
                .unwrap();
        }

        assert_eq!(ring.active_signed_pre_key().unwrap().map(|r| r.id), Some(3));
    }

    #[test]
    fn corrupt_record_is_reported() {
        let ring = keyring();
        ring.store().put(Category::PreKeys, "4", vec![0xFF, 0x00]).unwrap();

        assert!(matches!(ring.pre_key(4), Err(StoreError::Corrupt { category: Category::PreKeys, .. })));
    }

    #[test]
    fn wipe_clears_everything() {
        let ring = keyring();
        ring.put_registration_id(42).unwrap();
        ring.put_pre_key(&PreKeyRecord::generate(1, [1; 32])).unwrap();

        ring.wipe().unwrap();
        assert!(ring.store().is_empty());
        assert_eq!(ring.registration_id().unwrap(), None);
    }
}
