//! X3DH key agreement.
//!
//! The initiator (A) combines its identity key and a fresh ephemeral key
//! with the responder's (B) bundle:
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)    only when B's bundle carried a one-time key
//! ```
//!
//! `SK = HKDF(0xFF * 32 || DH1 || DH2 || DH3 [|| DH4])`, then two chain seeds
//! are expanded from `SK`, one per direction. The responder computes the
//! same agreements with the roles of public and secret swapped.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{
    bundle::KeyBundle,
    error::CryptoError,
    keys::{IDENTITY_KEY_SIZE, IdentityKey, IdentityKeyPair, KEY_SIZE, KeyPair, PublicKey},
};

/// Domain separator for the root secret.
const ROOT_INFO: &[u8] = b"courier-x3dh-v1";

/// Domain separator for the initiator-to-responder chain.
const INITIATOR_CHAIN_INFO: &[u8] = b"courier-chain-initiator";

/// Domain separator for the responder-to-initiator chain.
const RESPONDER_CHAIN_INFO: &[u8] = b"courier-chain-responder";

/// Result of a completed agreement.
///
/// Both sides hold identical values; which chain they send on depends on
/// their role.
pub struct Agreement {
    /// Seed for messages sent by the initiator
    pub initiator_chain: [u8; KEY_SIZE],
    /// Seed for messages sent by the responder
    pub responder_chain: [u8; KEY_SIZE],
    /// `IK_A || IK_B`, bound into every ciphertext as AEAD associated data
    pub associated_data: Vec<u8>,
}

impl Drop for Agreement {
    fn drop(&mut self) {
        self.initiator_chain.zeroize();
        self.responder_chain.zeroize();
    }
}

/// Run the agreement as initiator against a verified `bundle`.
pub fn initiate(
    local: &IdentityKeyPair,
    ephemeral: &KeyPair,
    bundle: &KeyBundle,
) -> Result<Agreement, CryptoError> {
    let spk = &bundle.signed_pre_key.public_key;

    let mut dh = vec![
        local.agree(spk)?,
        ephemeral.agree(bundle.identity_key.agreement_key())?,
        ephemeral.agree(spk)?,
    ];
    if let Some(opk) = &bundle.one_time_pre_key {
        dh.push(ephemeral.agree(&opk.public_key)?);
    }

    derive(&mut dh, &local.public(), &bundle.identity_key)
}

/// Run the agreement as responder.
///
/// `base_key` is the initiator's ephemeral public key; `one_time` must be
/// the secret for the one-time key the initiator used, if any.
pub fn respond(
    local: &IdentityKeyPair,
    signed_pre_key: &KeyPair,
    one_time_pre_key: Option<&KeyPair>,
    remote_identity: &IdentityKey,
    base_key: &PublicKey,
) -> Result<Agreement, CryptoError> {
    let mut dh = vec![
        signed_pre_key.agree(remote_identity.agreement_key())?,
        local.agree(base_key)?,
        signed_pre_key.agree(base_key)?,
    ];
    if let Some(opk) = one_time_pre_key {
        dh.push(opk.agree(base_key)?);
    }

    derive(&mut dh, remote_identity, &local.public())
}

fn derive(
    dh: &mut [[u8; KEY_SIZE]],
    initiator: &IdentityKey,
    responder: &IdentityKey,
) -> Result<Agreement, CryptoError> {
    let mut ikm = Vec::with_capacity(KEY_SIZE * (dh.len() + 1));
    ikm.extend_from_slice(&[0xFF; KEY_SIZE]);
    for secret in dh.iter() {
        ikm.extend_from_slice(secret);
    }

    let hk = Hkdf::<Sha256>::new(Some(&[0u8; KEY_SIZE]), &ikm);
    let mut root = [0u8; KEY_SIZE];
    let expanded = hk.expand(ROOT_INFO, &mut root);

    ikm.zeroize();
    for secret in dh.iter_mut() {
        secret.zeroize();
    }
    expanded.map_err(|e| CryptoError::InvalidKey { reason: format!("hkdf: {e}") })?;

    let chains = Hkdf::<Sha256>::from_prk(&root);
    root.zeroize();
    let chains = chains.map_err(|e| CryptoError::InvalidKey { reason: format!("hkdf: {e}") })?;

    let mut agreement = Agreement {
        initiator_chain: [0u8; KEY_SIZE],
        responder_chain: [0u8; KEY_SIZE],
        associated_data: Vec::with_capacity(2 * IDENTITY_KEY_SIZE),
    };
    chains
        .expand(INITIATOR_CHAIN_INFO, &mut agreement.initiator_chain)
        .and_then(|()| chains.expand(RESPONDER_CHAIN_INFO, &mut agreement.responder_chain))
        .map_err(|e| CryptoError::InvalidKey { reason: format!("hkdf: {e}") })?;

    agreement.associated_data.extend_from_slice(&initiator.to_bytes());
    agreement.associated_data.extend_from_slice(&responder.to_bytes());

    Ok(agreement)
}
