//! Symmetric ratchet for forward-secure message key derivation.
//!
//! # Security Properties
//!
//! - Forward Secrecy: Old chain keys are overwritten when advancing
//! - Key Uniqueness: Each generation produces a unique message key
//! - Determinism: Same seed always produces same key sequence
//! - Replay: A generation's key is handed out at most once

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// Maximum number of generations to skip when catching up.
pub const MAX_SKIP: u32 = 1000;

/// Maximum number of skipped message keys retained for late arrivals.
///
/// The oldest are evicted first; a message whose key was evicted is treated
/// as a duplicate.
pub const MAX_SKIPPED_KEYS: usize = 256;

/// A message key derived from the ratchet.
///
/// Used for a single encryption or decryption, then discarded.
#[derive(Clone)]
pub struct MessageKey {
    key: [u8; 32],
    generation: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Ratchet generation this key was derived from.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Forward-secure symmetric ratchet.
///
/// Each [`advance()`](Self::advance) derives a message key from the current
/// chain key, derives the next chain key, then overwrites the old one.
///
/// A receiving chain uses [`key_for()`](Self::key_for) instead, which skips
/// forward to a target generation and remembers the keys it stepped over so
/// that reordered messages still decrypt.
#[derive(Clone, Serialize, Deserialize)]
pub struct SymmetricRatchet {
    chain_key: [u8; 32],
    generation: u32,
    skipped: BTreeMap<u32, [u8; 32]>,
}

impl SymmetricRatchet {
    /// Create a new ratchet from a chain seed (generation 0).
    pub fn new(seed: &[u8; 32]) -> Self {
        Self { chain_key: *seed, generation: 0, skipped: BTreeMap::new() }
    }

    /// Next generation this ratchet will produce.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Number of skipped keys currently retained.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Advance the ratchet and derive the next message key.
    pub fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        if self.generation == u32::MAX {
            return Err(CryptoError::GenerationOverflow { current: self.generation });
        }

        let message_key = self.derive(MESSAGE_LABEL);
        let next_chain_key = self.derive(CHAIN_LABEL);

        self.chain_key.zeroize();
        self.chain_key = next_chain_key;

        let current = self.generation;
        self.generation += 1;

        Ok(MessageKey { key: message_key, generation: current })
    }

    /// Message key for generation `target` on a receiving chain.
    ///
    /// Past generations are served from the skipped-key cache exactly once.
    pub fn key_for(&mut self, target: u32) -> Result<MessageKey, CryptoError> {
        if target < self.generation {
            return self
                .skipped
                .remove(&target)
                .map(|key| MessageKey { key, generation: target })
                .ok_or(CryptoError::DuplicateMessage { generation: target });
        }

        if target - self.generation > MAX_SKIP {
            return Err(CryptoError::TooFarAhead { current: self.generation, requested: target });
        }

        while self.generation < target {
            let skipped = self.advance()?;
            self.skipped.insert(skipped.generation, skipped.key);
        }
        while self.skipped.len() > MAX_SKIPPED_KEYS {
            if let Some(mut entry) = self.skipped.first_entry() {
                entry.get_mut().zeroize();
                entry.remove();
            }
        }

        self.advance()
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}

impl Drop for SymmetricRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        for key in self.skipped.values_mut() {
            key.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn test_seed() -> [u8; 32] {
        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8;
        }
        seed
    }

    #[test]
    fn advance_increments_generation() {
        let mut ratchet = SymmetricRatchet::new(&test_seed());

        assert_eq!(ratchet.advance().unwrap().generation(), 0);
        assert_eq!(ratchet.advance().unwrap().generation(), 1);
        assert_eq!(ratchet.generation(), 2);
    }

    #[test]
    fn advance_produces_unique_keys() {
        let mut ratchet = SymmetricRatchet::new(&test_seed());

        let key0 = ratchet.advance().unwrap();
        let key1 = ratchet.advance().unwrap();

        assert_ne!(key0.key(), key1.key(), "keys must be unique");
    }

    #[test]
    fn ratchet_is_deterministic() {
        let mut r1 = SymmetricRatchet::new(&test_seed());
        let mut r2 = SymmetricRatchet::new(&test_seed());

        for _ in 0..10 {
            assert_eq!(r1.advance().unwrap().key(), r2.advance().unwrap().key());
        }
    }

    #[test]
    fn key_for_matches_sequential_advance() {
        let mut sender = SymmetricRatchet::new(&test_seed());
        for _ in 0..5 {
            sender.advance().unwrap();
        }
        let sequential = sender.advance().unwrap();

        let mut receiver = SymmetricRatchet::new(&test_seed());
        let skipped = receiver.key_for(5).unwrap();

        assert_eq!(sequential.key(), skipped.key());
        assert_eq!(receiver.generation(), 6);
        assert_eq!(receiver.skipped_len(), 5);
    }

    #[test]
    fn skipped_keys_serve_late_messages_once() {
        let mut sender = SymmetricRatchet::new(&test_seed());
        let first = sender.advance().unwrap();

        let mut receiver = SymmetricRatchet::new(&test_seed());
        receiver.key_for(3).unwrap();

        assert_eq!(receiver.key_for(0).unwrap().key(), first.key());
        assert!(matches!(
            receiver.key_for(0),
            Err(CryptoError::DuplicateMessage { generation: 0 })
        ));
    }

    #[test]
    fn current_generation_cannot_be_replayed() {
        let mut receiver = SymmetricRatchet::new(&test_seed());
        receiver.key_for(0).unwrap();

        assert!(matches!(receiver.key_for(0), Err(CryptoError::DuplicateMessage { .. })));
    }

    #[test]
    fn key_for_rejects_too_far_ahead() {
        let mut receiver = SymmetricRatchet::new(&test_seed());

        assert!(matches!(
            receiver.key_for(MAX_SKIP + 1),
            Err(CryptoError::TooFarAhead { current: 0, .. })
        ));
        assert_eq!(receiver.generation(), 0);
    }

    #[test]
    fn skipped_cache_is_bounded() {
        let mut receiver = SymmetricRatchet::new(&test_seed());
        receiver.key_for(MAX_SKIP).unwrap();

        assert_eq!(receiver.skipped_len(), MAX_SKIPPED_KEYS);
        // The oldest were evicted
        assert!(matches!(receiver.key_for(0), Err(CryptoError::DuplicateMessage { .. })));
        assert!(receiver.key_for(MAX_SKIP - 1).is_ok());
    }

    #[test]
    fn state_survives_cbor() {
        let mut ratchet = SymmetricRatchet::new(&test_seed());
        ratchet.key_for(2).unwrap();

        let mut buf = Vec::new();
        ciborium::ser::into_writer(&ratchet, &mut buf).unwrap();
        let mut restored: SymmetricRatchet = ciborium::de::from_reader(buf.as_slice()).unwrap();

        assert_eq!(restored.generation(), 3);
        assert_eq!(restored.key_for(1).unwrap().key(), ratchet.key_for(1).unwrap().key());
    }

    /// Generations `0..n` in a random delivery order.
    fn delivery_order() -> impl Strategy<Value = Vec<u32>> {
        (1u32..48).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_receiver_matches_sender_in_any_order(
            seed in any::<[u8; 32]>(),
            order in delivery_order(),
        ) {
            let mut sender = SymmetricRatchet::new(&seed);
            let sent: Vec<[u8; 32]> =
                (0..order.len()).map(|_| *sender.advance().unwrap().key()).collect();

            let mut receiver = SymmetricRatchet::new(&seed);
            for &generation in &order {
                let key = receiver.key_for(generation).unwrap();
                prop_assert_eq!(key.generation(), generation);
                prop_assert_eq!(key.key(), &sent[generation as usize]);
            }

            // Every key was handed out exactly once
            prop_assert_eq!(receiver.skipped_len(), 0);
            for &generation in &order {
                let replay = receiver.key_for(generation);
                let is_duplicate = matches!(replay, Err(CryptoError::DuplicateMessage { .. }));
                prop_assert!(is_duplicate);
            }
        }

        #[test]
        fn prop_jump_beyond_skip_limit_leaves_chain_untouched(
            seed in any::<[u8; 32]>(),
            start in 0u32..16,
            beyond in 1u32..10_000,
        ) {
            let mut receiver = SymmetricRatchet::new(&seed);
            receiver.key_for(start).unwrap();
            let skipped = receiver.skipped_len();

            let target = start + 1 + MAX_SKIP + beyond;
            let result = receiver.key_for(target);
            prop_assert!(
                matches!(result, Err(CryptoError::TooFarAhead { .. })),
                "expected TooFarAhead"
            );
            prop_assert_eq!(receiver.generation(), start + 1);
            prop_assert_eq!(receiver.skipped_len(), skipped);
        }
    }
}
