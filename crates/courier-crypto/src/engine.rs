//! The crypto engine seam.
//!
//! Everything above this crate talks to session cryptography through
//! [`CryptoEngine`], so the session layer can be driven by a different
//! implementation in tests. [`RatchetEngine`] is the production engine.

use courier_proto::payloads::keys::KeyBundleData;

use crate::{
    aead, agreement,
    bundle::KeyBundle,
    error::CryptoError,
    keys::{IdentityKeyPair, KeyPair, PreKeyRecord, SignedPreKeyRecord},
    message::{CiphertextMessage, PreKeyMessage, RatchetMessage},
    ratchet::SymmetricRatchet,
    session::{PendingPreKey, SessionState},
};

/// Key generation, agreement and per-message encryption.
///
/// Implementations are deterministic: every random input is a parameter.
pub trait CryptoEngine: Send + Sync + 'static {
    /// Create an identity from two 32-byte seeds.
    fn generate_identity(&self, signing_seed: [u8; 32], agreement_seed: [u8; 32])
    -> IdentityKeyPair;

    /// Create one-time pre-key `id`.
    fn generate_pre_key(&self, id: u32, seed: [u8; 32]) -> PreKeyRecord;

    /// Create signed pre-key `id`, signed by `identity`.
    fn generate_signed_pre_key(
        &self,
        identity: &IdentityKeyPair,
        id: u32,
        seed: [u8; 32],
        now_ms: u64,
    ) -> SignedPreKeyRecord;

    /// Parse and verify a bundle fetched from the directory.
    fn process_bundle(&self, data: &KeyBundleData) -> Result<KeyBundle, CryptoError>;

    /// Start a session as initiator.
    ///
    /// Every message encrypted with the returned state is a pre-key message
    /// until the first reply decrypts.
    fn initiate_session(
        &self,
        local: &IdentityKeyPair,
        local_registration_id: u32,
        bundle: &KeyBundle,
        ephemeral_seed: [u8; 32],
    ) -> Result<SessionState, CryptoError>;

    /// Build the responder state for an incoming pre-key message.
    ///
    /// The caller looks up the pre-keys the message names.
    fn accept_session(
        &self,
        local: &IdentityKeyPair,
        signed_pre_key: &SignedPreKeyRecord,
        one_time_pre_key: Option<&PreKeyRecord>,
        message: &PreKeyMessage,
    ) -> Result<SessionState, CryptoError>;

    /// Encrypt on `state`'s sending chain.
    fn encrypt(
        &self,
        state: &mut SessionState,
        plaintext: &[u8],
        nonce: [u8; aead::NONCE_SIZE],
    ) -> Result<CiphertextMessage, CryptoError>;

    /// Decrypt on `state`'s receiving chain.
    ///
    /// `state` is left unchanged on error.
    fn decrypt(
        &self,
        state: &mut SessionState,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, CryptoError>;
}

/// X3DH agreement followed by a pair of symmetric ratchets.
#[derive(Debug, Clone, Copy, Default)]
pub struct RatchetEngine;

impl RatchetEngine {
    fn aad(state: &SessionState, generation: u32) -> Vec<u8> {
        let mut aad = Vec::with_capacity(state.associated_data.len() + 4);
        aad.extend_from_slice(&state.associated_data);
        aad.extend_from_slice(&generation.to_be_bytes());
        aad
    }
}

impl CryptoEngine for RatchetEngine {
    fn generate_identity(
        &self,
        signing_seed: [u8; 32],
        agreement_seed: [u8; 32],
    ) -> IdentityKeyPair {
        IdentityKeyPair::from_seeds(signing_seed, agreement_seed)
    }

    fn generate_pre_key(&self, id: u32, seed: [u8; 32]) -> PreKeyRecord {
        PreKeyRecord::generate(id, seed)
    }

    fn generate_signed_pre_key(
        &self,
        identity: &IdentityKeyPair,
        id: u32,
        seed: [u8; 32],
        now_ms: u64,
    ) -> SignedPreKeyRecord {
        SignedPreKeyRecord::generate(id, identity, seed, now_ms)
    }

    fn process_bundle(&self, data: &KeyBundleData) -> Result<KeyBundle, CryptoError> {
        KeyBundle::try_from(data)
    }

    fn initiate_session(
        &self,
        local: &IdentityKeyPair,
        local_registration_id: u32,
        bundle: &KeyBundle,
        ephemeral_seed: [u8; 32],
    ) -> Result<SessionState, CryptoError> {
        bundle.verify()?;

        let ephemeral = KeyPair::from_seed(ephemeral_seed);
        let agreed = agreement::initiate(local, &ephemeral, bundle)?;

        Ok(SessionState {
            local_identity: local.public(),
            remote_identity: bundle.identity_key,
            remote_registration_id: bundle.registration_id,
            base_key: ephemeral.public(),
            associated_data: agreed.associated_data.clone(),
            sending: SymmetricRatchet::new(&agreed.initiator_chain),
            receiving: SymmetricRatchet::new(&agreed.responder_chain),
            pending_pre_key: Some(PendingPreKey {
                local_registration_id,
                signed_pre_key_id: bundle.signed_pre_key.id,
                one_time_pre_key_id: bundle.one_time_pre_key.map(|pk| pk.id),
            }),
        })
    }

    fn accept_session(
        &self,
        local: &IdentityKeyPair,
        signed_pre_key: &SignedPreKeyRecord,
        one_time_pre_key: Option<&PreKeyRecord>,
        message: &PreKeyMessage,
    ) -> Result<SessionState, CryptoError> {
        if signed_pre_key.id != message.signed_pre_key_id {
            return Err(CryptoError::InvalidKey {
                reason: format!(
                    "message names signed pre-key {}, got {}",
                    message.signed_pre_key_id, signed_pre_key.id
                ),
            });
        }
        if one_time_pre_key.map(|pk| pk.id) != message.one_time_pre_key_id {
            return Err(CryptoError::InvalidKey {
                reason: "one-time pre-key does not match message".to_string(),
            });
        }

        let agreed = agreement::respond(
            local,
            &signed_pre_key.key_pair,
            one_time_pre_key.map(|pk| &pk.key_pair),
            &message.identity_key,
            &message.base_key,
        )?;

        Ok(SessionState {
            local_identity: local.public(),
            remote_identity: message.identity_key,
            remote_registration_id: message.registration_id,
            base_key: message.base_key,
            associated_data: agreed.associated_data.clone(),
            sending: SymmetricRatchet::new(&agreed.responder_chain),
            receiving: SymmetricRatchet::new(&agreed.initiator_chain),
            pending_pre_key: None,
        })
    }

    fn encrypt(
        &self,
        state: &mut SessionState,
        plaintext: &[u8],
        nonce: [u8; aead::NONCE_SIZE],
    ) -> Result<CiphertextMessage, CryptoError> {
        let key = state.sending.advance()?;
        let aad = Self::aad(state, key.generation());
        let message = RatchetMessage {
            generation: key.generation(),
            nonce,
            ciphertext: aead::seal(&key, &nonce, &aad, plaintext),
        };

        Ok(match &state.pending_pre_key {
            Some(pending) => CiphertextMessage::PreKey(PreKeyMessage {
                registration_id: pending.local_registration_id,
                signed_pre_key_id: pending.signed_pre_key_id,
                one_time_pre_key_id: pending.one_time_pre_key_id,
                base_key: state.base_key,
                identity_key: state.local_identity,
                message,
            }),
            None => CiphertextMessage::Ratchet(message),
        })
    }

    fn decrypt(
        &self,
        state: &mut SessionState,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut receiving = state.receiving.clone();
        let key = receiving.key_for(message.generation)?;
        let aad = Self::aad(state, message.generation);
        let plaintext = aead::open(&key, &message.nonce, &aad, &message.ciphertext)?;

        state.receiving = receiving;
        state.pending_pre_key = None;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRecord;

    struct Device {
        identity: IdentityKeyPair,
        signed: SignedPreKeyRecord,
        one_time: PreKeyRecord,
    }

    fn device(seed: u8) -> Device {
        let engine = RatchetEngine;
        let identity = engine.generate_identity([seed; 32], [seed + 1; 32]);
        let signed = engine.generate_signed_pre_key(&identity, 1, [seed + 2; 32], 0);
        let one_time = engine.generate_pre_key(100, [seed + 3; 32]);
        Device { identity, signed, one_time }
    }

    fn bundle(d: &Device) -> KeyBundle {
        let data = KeyBundleData {
            identity_key: d.identity.public().to_bytes().to_vec(),
            registration_id: 200,
            signed_pre_key: d.signed.to_data(),
            one_time_pre_key: Some(d.one_time.to_data()),
        };
        RatchetEngine.process_bundle(&data).unwrap()
    }

    fn pre_key(msg: CiphertextMessage) -> PreKeyMessage {
        match msg {
            CiphertextMessage::PreKey(m) => m,
            CiphertextMessage::Ratchet(_) => unreachable!("expected pre-key message"),
        }
    }

    fn ratchet(msg: CiphertextMessage) -> RatchetMessage {
        match msg {
            CiphertextMessage::Ratchet(m) => m,
            CiphertextMessage::PreKey(_) => unreachable!("expected ratchet message"),
        }
    }

    /// Alice initiates to Bob; returns (alice state, bob state) after one
    /// message each way.
    fn established() -> (SessionState, SessionState) {
        let engine = RatchetEngine;
        let alice = device(10);
        let bob = device(20);

        let mut a = engine.initiate_session(&alice.identity, 100, &bundle(&bob), [7; 32]).unwrap();
        let first = pre_key(engine.encrypt(&mut a, b"hi bob", [1; 24]).unwrap());

        let mut b = engine
            .accept_session(&bob.identity, &bob.signed, Some(&bob.one_time), &first)
            .unwrap();
        assert_eq!(engine.decrypt(&mut b, &first.message).unwrap(), b"hi bob");

        let reply = ratchet(engine.encrypt(&mut b, b"hi alice", [2; 24]).unwrap());
        assert_eq!(engine.decrypt(&mut a, &reply).unwrap(), b"hi alice");

        (a, b)
    }

    #[test]
    fn initiator_sends_pre_key_messages_until_reply() {
        let engine = RatchetEngine;
        let alice = device(10);
        let bob = device(20);

        let mut a = engine.initiate_session(&alice.identity, 100, &bundle(&bob), [7; 32]).unwrap();
        let m1 = pre_key(engine.encrypt(&mut a, b"one", [1; 24]).unwrap());
        let m2 = pre_key(engine.encrypt(&mut a, b"two", [2; 24]).unwrap());

        assert_eq!(m1.base_key, m2.base_key);
        assert_eq!(m1.one_time_pre_key_id, Some(100));
        assert_eq!(m2.message.generation, 1);
        assert!(a.is_pending());
    }

    #[test]
    fn established_session_uses_ratchet_messages() {
        let engine = RatchetEngine;
        let (mut a, mut b) = established();

        assert!(!a.is_pending());
        let msg = ratchet(engine.encrypt(&mut a, b"next", [3; 24]).unwrap());
        assert_eq!(engine.decrypt(&mut b, &msg).unwrap(), b"next");
    }

    #[test]
    fn replayed_message_is_rejected() {
        let engine = RatchetEngine;
        let (mut a, mut b) = established();

        let msg = ratchet(engine.encrypt(&mut a, b"once", [3; 24]).unwrap());
        engine.decrypt(&mut b, &msg).unwrap();

        assert!(matches!(
            engine.decrypt(&mut b, &msg),
            Err(CryptoError::DuplicateMessage { .. })
        ));
    }

    #[test]
    fn out_of_order_messages_decrypt() {
        let engine = RatchetEngine;
        let (mut a, mut b) = established();

        let m1 = ratchet(engine.encrypt(&mut a, b"1", [3; 24]).unwrap());
        let m2 = ratchet(engine.encrypt(&mut a, b"2", [4; 24]).unwrap());
        let m3 = ratchet(engine.encrypt(&mut a, b"3", [5; 24]).unwrap());

        assert_eq!(engine.decrypt(&mut b, &m3).unwrap(), b"3");
        assert_eq!(engine.decrypt(&mut b, &m1).unwrap(), b"1");
        assert_eq!(engine.decrypt(&mut b, &m2).unwrap(), b"2");
    }

    #[test]
    fn forged_message_does_not_advance_state() {
        let engine = RatchetEngine;
        let (mut a, mut b) = established();

        let mut msg = ratchet(engine.encrypt(&mut a, b"real", [3; 24]).unwrap());
        let real = msg.clone();
        msg.ciphertext[0] ^= 1;

        assert!(engine.decrypt(&mut b, &msg).is_err());
        assert_eq!(engine.decrypt(&mut b, &real).unwrap(), b"real");
    }

    #[test]
    fn accept_rejects_mismatched_one_time_key() {
        let engine = RatchetEngine;
        let alice = device(10);
        let bob = device(20);

        let mut a = engine.initiate_session(&alice.identity, 100, &bundle(&bob), [7; 32]).unwrap();
        let first = pre_key(engine.encrypt(&mut a, b"hi", [1; 24]).unwrap());

        assert!(matches!(
            engine.accept_session(&bob.identity, &bob.signed, None, &first),
            Err(CryptoError::InvalidKey { .. })
        ));
    }

    #[test]
    fn message_from_other_session_fails() {
        let engine = RatchetEngine;
        let (mut a, _) = established();
        let (_, mut other_b) = {
            let alice = device(30);
            let bob = device(20);
            let mut a2 =
                engine.initiate_session(&alice.identity, 1, &bundle(&bob), [8; 32]).unwrap();
            let first = pre_key(engine.encrypt(&mut a2, b"x", [1; 24]).unwrap());
            let b2 = engine
                .accept_session(&bob.identity, &bob.signed, Some(&bob.one_time), &first)
                .unwrap();
            (a2, b2)
        };

        let msg = ratchet(engine.encrypt(&mut a, b"wrong chain", [3; 24]).unwrap());
        assert!(matches!(
            engine.decrypt(&mut other_b, &msg),
            Err(CryptoError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn record_round_trips_through_storage_mid_session() {
        let engine = RatchetEngine;
        let (mut a, b) = established();

        let bytes = SessionRecord::new(b).to_bytes().unwrap();
        let mut restored = SessionRecord::from_bytes(&bytes).unwrap();

        let msg = ratchet(engine.encrypt(&mut a, b"after restart", [9; 24]).unwrap());
        let plaintext = restored.decrypt_with(|s| engine.decrypt(s, &msg)).unwrap();
        assert_eq!(plaintext, b"after restart");
    }
}
