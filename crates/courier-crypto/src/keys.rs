//! Key material: identity keys, pre-keys, and their records.
//!
//! Secrets are built from caller-supplied seed bytes. Nothing here touches
//! an RNG.

use std::fmt;

use courier_proto::payloads::keys::{PreKeyData, SignedPreKeyData};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Size of X25519 and Ed25519 public keys.
pub const KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a serialized [`IdentityKey`].
pub const IDENTITY_KEY_SIZE: usize = 2 * KEY_SIZE;

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Wrap raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice of exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
            reason: format!("public key must be {KEY_SIZE} bytes, got {}", bytes.len()),
        })?;
        Ok(Self(arr))
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// X25519 key pair.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "SecretBytes", from = "SecretBytes")]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Derive a key pair from 32 seed bytes (clamped by X25519).
    #[must_use]
    pub fn from_seed(seed: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(seed);
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    /// Public half.
    #[must_use]
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Diffie-Hellman agreement with `theirs`.
    ///
    /// Rejects low-order points that would make the output independent of
    /// our secret.
    pub fn agree(&self, theirs: &PublicKey) -> Result<[u8; KEY_SIZE], CryptoError> {
        let shared = self.secret.diffie_hellman(&x25519_dalek::PublicKey::from(theirs.0));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey {
                reason: "non-contributory X25519 public key".to_string(),
            });
        }
        Ok(shared.to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Serialized form of a single secret scalar.
#[derive(Serialize, Deserialize)]
struct SecretBytes {
    secret: [u8; KEY_SIZE],
}

impl From<KeyPair> for SecretBytes {
    fn from(pair: KeyPair) -> Self {
        Self { secret: pair.secret.to_bytes() }
    }
}

impl From<SecretBytes> for KeyPair {
    fn from(bytes: SecretBytes) -> Self {
        Self::from_seed(bytes.secret)
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Public identity of a device.
///
/// Two keys: an Ed25519 verifying key for pre-key signatures and an X25519
/// key for agreement. Serialized as 64 bytes, signing key first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    signing: [u8; KEY_SIZE],
    agreement: PublicKey,
}

impl IdentityKey {
    /// Parse and validate a 64-byte identity key.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != IDENTITY_KEY_SIZE {
            return Err(CryptoError::InvalidKey {
                reason: format!(
                    "identity key must be {IDENTITY_KEY_SIZE} bytes, got {}",
                    bytes.len()
                ),
            });
        }

        let (signing, agreement) = bytes.split_at(KEY_SIZE);
        let signing: [u8; KEY_SIZE] = signing.try_into().map_err(|_| CryptoError::InvalidKey {
            reason: "identity signing key truncated".to_string(),
        })?;

        VerifyingKey::from_bytes(&signing).map_err(|e| CryptoError::InvalidKey {
            reason: format!("identity signing key: {e}"),
        })?;

        Ok(Self { signing, agreement: PublicKey::from_slice(agreement)? })
    }

    /// 64-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_SIZE] {
        let mut out = [0u8; IDENTITY_KEY_SIZE];
        out[..KEY_SIZE].copy_from_slice(&self.signing);
        out[KEY_SIZE..].copy_from_slice(self.agreement.as_bytes());
        out
    }

    /// X25519 half, used in key agreement.
    #[must_use]
    pub fn agreement_key(&self) -> &PublicKey {
        &self.agreement
    }

    /// Verify an Ed25519 `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let verifying =
            VerifyingKey::from_bytes(&self.signing).map_err(|_| CryptoError::InvalidSignature)?;
        let signature =
            Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        verifying.verify(message, &signature).map_err(|_| CryptoError::InvalidSignature)
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.signing;
        write!(f, "IdentityKey({:02x}{:02x}{:02x}{:02x}..)", s[0], s[1], s[2], s[3])
    }
}

/// Long-lived identity of this device. Created once at registration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "IdentitySecretBytes", from = "IdentitySecretBytes")]
pub struct IdentityKeyPair {
    signing: SigningKey,
    agreement: KeyPair,
}

impl IdentityKeyPair {
    /// Build from two independent 32-byte seeds.
    #[must_use]
    pub fn from_seeds(signing_seed: [u8; KEY_SIZE], agreement_seed: [u8; KEY_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&signing_seed),
            agreement: KeyPair::from_seed(agreement_seed),
        }
    }

    /// Public identity.
    #[must_use]
    pub fn public(&self) -> IdentityKey {
        IdentityKey {
            signing: self.signing.verifying_key().to_bytes(),
            agreement: self.agreement.public(),
        }
    }

    /// Sign `message` with the identity signing key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }

    /// Agreement with the identity X25519 secret.
    pub fn agree(&self, theirs: &PublicKey) -> Result<[u8; KEY_SIZE], CryptoError> {
        self.agreement.agree(theirs)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair").field("public", &self.public()).finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct IdentitySecretBytes {
    signing: [u8; KEY_SIZE],
    agreement: [u8; KEY_SIZE],
}

impl From<IdentityKeyPair> for IdentitySecretBytes {
    fn from(pair: IdentityKeyPair) -> Self {
        Self { signing: pair.signing.to_bytes(), agreement: pair.agreement.secret.to_bytes() }
    }
}

impl From<IdentitySecretBytes> for IdentityKeyPair {
    fn from(bytes: IdentitySecretBytes) -> Self {
        Self::from_seeds(bytes.signing, bytes.agreement)
    }
}

impl Drop for IdentitySecretBytes {
    fn drop(&mut self) {
        self.signing.zeroize();
        self.agreement.zeroize();
    }
}

/// One-time pre-key. Consumed by exactly one session establishment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyRecord {
    /// Pre-key id
    pub id: u32,
    /// Key pair
    pub key_pair: KeyPair,
}

impl PreKeyRecord {
    /// Generate pre-key `id` from seed bytes.
    #[must_use]
    pub fn generate(id: u32, seed: [u8; KEY_SIZE]) -> Self {
        Self { id, key_pair: KeyPair::from_seed(seed) }
    }

    /// Public half in wire form.
    #[must_use]
    pub fn to_data(&self) -> PreKeyData {
        PreKeyData { key_id: self.id, public_key: self.key_pair.public().as_bytes().to_vec() }
    }
}

/// Medium-term pre-key signed by the identity key.
///
/// Ids are strictly increasing; the highest is active. Older records stay
/// around to answer initial messages that were built against them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    /// Signed pre-key id
    pub id: u32,
    /// Key pair
    pub key_pair: KeyPair,
    /// Ed25519 signature over the public key
    pub signature: Vec<u8>,
    /// Creation time, Unix milliseconds
    pub created_at_ms: u64,
}

impl SignedPreKeyRecord {
    /// Generate signed pre-key `id` and sign it with `identity`.
    #[must_use]
    pub fn generate(
        id: u32,
        identity: &IdentityKeyPair,
        seed: [u8; KEY_SIZE],
        created_at_ms: u64,
    ) -> Self {
        let key_pair = KeyPair::from_seed(seed);
        let signature = identity.sign(key_pair.public().as_bytes()).to_vec();
        Self { id, key_pair, signature, created_at_ms }
    }

    /// Public half in wire form.
    #[must_use]
    pub fn to_data(&self) -> SignedPreKeyData {
        SignedPreKeyData {
            key_id: self.id,
            public_key: self.key_pair.public().as_bytes().to_vec(),
            signature: self.signature.clone(),
        }
    }
}
