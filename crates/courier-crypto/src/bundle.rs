//! Typed key bundles.
//!
//! The relay hands out [`KeyBundleData`] as raw bytes. [`KeyBundle`] is the
//! parsed form: every key has the right length and the signed pre-key
//! signature has been checked against the identity key.

use courier_proto::payloads::keys::KeyBundleData;

use crate::{
    error::CryptoError,
    keys::{IdentityKey, PublicKey},
};

/// Public half of a signed pre-key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKeyPublic {
    /// Signed pre-key id
    pub id: u32,
    /// X25519 public key
    pub public_key: PublicKey,
    /// Identity signature over `public_key`
    pub signature: Vec<u8>,
}

/// Public half of a one-time pre-key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreKeyPublic {
    /// Pre-key id
    pub id: u32,
    /// X25519 public key
    pub public_key: PublicKey,
}

/// A peer's published key material, verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBundle {
    /// Peer identity
    pub identity_key: IdentityKey,
    /// Peer registration id
    pub registration_id: u32,
    /// Active signed pre-key
    pub signed_pre_key: SignedPreKeyPublic,
    /// One-time pre-key, if the peer's supply was not exhausted
    pub one_time_pre_key: Option<PreKeyPublic>,
}

impl KeyBundle {
    /// Check the signed pre-key signature.
    pub fn verify(&self) -> Result<(), CryptoError> {
        self.identity_key
            .verify(self.signed_pre_key.public_key.as_bytes(), &self.signed_pre_key.signature)
    }
}

impl TryFrom<&KeyBundleData> for KeyBundle {
    type Error = CryptoError;

    /// Parse and verify a bundle from the wire.
    fn try_from(data: &KeyBundleData) -> Result<Self, Self::Error> {
        let bundle = Self {
            identity_key: IdentityKey::from_slice(&data.identity_key)?,
            registration_id: data.registration_id,
            signed_pre_key: SignedPreKeyPublic {
                id: data.signed_pre_key.key_id,
                public_key: PublicKey::from_slice(&data.signed_pre_key.public_key)?,
                signature: data.signed_pre_key.signature.clone(),
            },
            one_time_pre_key: data
                .one_time_pre_key
                .as_ref()
                .map(|pk| {
                    Ok::<_, CryptoError>(PreKeyPublic {
                        id: pk.key_id,
                        public_key: PublicKey::from_slice(&pk.public_key)?,
                    })
                })
                .transpose()?,
        };

        bundle.verify()?;
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{IdentityKeyPair, PreKeyRecord, SignedPreKeyRecord};

    fn bundle_data(with_one_time: bool) -> KeyBundleData {
        let identity = IdentityKeyPair::from_seeds([1; 32], [2; 32]);
        let signed = SignedPreKeyRecord::generate(1, &identity, [3; 32], 0);
        let one_time = PreKeyRecord::generate(7, [4; 32]);

        KeyBundleData {
            identity_key: identity.public().to_bytes().to_vec(),
            registration_id: 42,
            signed_pre_key: signed.to_data(),
            one_time_pre_key: with_one_time.then(|| one_time.to_data()),
        }
    }

    #[test]
    fn valid_bundle_parses() {
        let bundle = KeyBundle::try_from(&bundle_data(true)).unwrap();

        assert_eq!(bundle.registration_id, 42);
        assert_eq!(bundle.signed_pre_key.id, 1);
        assert_eq!(bundle.one_time_pre_key.map(|pk| pk.id), Some(7));
    }

    #[test]
    fn bundle_without_one_time_key_parses() {
        let bundle = KeyBundle::try_from(&bundle_data(false)).unwrap();
        assert!(bundle.one_time_pre_key.is_none());
    }

    #[test]
    fn tampered_signed_pre_key_is_rejected() {
        let mut data = bundle_data(true);
        data.signed_pre_key.public_key[0] ^= 0x01;

        assert_eq!(KeyBundle::try_from(&data), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn short_identity_key_is_rejected() {
        let mut data = bundle_data(true);
        data.identity_key.truncate(32);

        assert!(matches!(KeyBundle::try_from(&data), Err(CryptoError::InvalidKey { .. })));
    }
}
