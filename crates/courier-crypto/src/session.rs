//! Per-peer session state.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{
    error::CryptoError,
    keys::{IdentityKey, PublicKey},
    ratchet::SymmetricRatchet,
};

/// Archived states kept per peer after a newer session replaces them.
pub const MAX_ARCHIVED_STATES: usize = 5;

/// Agreement parameters the initiator repeats on every message until the
/// responder's first reply arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    /// Our registration id
    pub local_registration_id: u32,
    /// Responder signed pre-key id
    pub signed_pre_key_id: u32,
    /// Responder one-time pre-key id
    pub one_time_pre_key_id: Option<u32>,
}

/// One pairwise session with a peer device.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub(crate) local_identity: IdentityKey,
    pub(crate) remote_identity: IdentityKey,
    pub(crate) remote_registration_id: u32,
    pub(crate) base_key: PublicKey,
    pub(crate) associated_data: Vec<u8>,
    pub(crate) sending: SymmetricRatchet,
    pub(crate) receiving: SymmetricRatchet,
    pub(crate) pending_pre_key: Option<PendingPreKey>,
}

impl SessionState {
    /// Peer identity this session was agreed with.
    pub fn remote_identity(&self) -> &IdentityKey {
        &self.remote_identity
    }

    /// Our identity when the session was agreed.
    pub fn local_identity(&self) -> &IdentityKey {
        &self.local_identity
    }

    /// Peer registration id, zero until learned.
    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    /// Initiator ephemeral key; identifies the agreement.
    pub fn base_key(&self) -> &PublicKey {
        &self.base_key
    }

    /// Whether we initiated and have not yet heard back.
    pub fn is_pending(&self) -> bool {
        self.pending_pre_key.is_some()
    }

    /// Next sending generation.
    pub fn sending_generation(&self) -> u32 {
        self.sending.generation()
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("remote_identity", &self.remote_identity)
            .field("base_key", &self.base_key)
            .field("sending", &self.sending.generation())
            .field("receiving", &self.receiving.generation())
            .field("pending", &self.pending_pre_key.is_some())
            .finish_non_exhaustive()
    }
}

/// All sessions held for one peer device.
///
/// `current` is used for sending. Replaced states are archived so that
/// messages already in flight under them still decrypt; a successful
/// decrypt with an archived state makes it current again.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: VecDeque<SessionState>,
}

impl SessionRecord {
    /// Record holding a single state.
    pub fn new(state: SessionState) -> Self {
        Self { current: Some(state), previous: VecDeque::new() }
    }

    /// State used for sending.
    pub fn current(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    /// Mutable state used for sending.
    pub fn current_mut(&mut self) -> Option<&mut SessionState> {
        self.current.as_mut()
    }

    /// Number of archived states.
    pub fn archived_len(&self) -> usize {
        self.previous.len()
    }

    /// Install `state` as current, archiving the old one.
    pub fn promote(&mut self, state: SessionState) {
        if let Some(old) = self.current.replace(state) {
            self.previous.push_front(old);
            self.previous.truncate(MAX_ARCHIVED_STATES);
        }
    }

    /// Whether any state (current or archived) came from `base_key`.
    pub fn has_base_key(&self, base_key: &PublicKey) -> bool {
        self.states().any(|s| &s.base_key == base_key)
    }

    /// Decrypt with the first state that accepts the message.
    ///
    /// Each attempt runs against a copy, so a failed attempt leaves the state
    /// untouched. The first error (from the current state) is returned when
    /// every state fails.
    pub fn decrypt_with<F>(&mut self, mut decrypt: F) -> Result<Vec<u8>, CryptoError>
    where
        F: FnMut(&mut SessionState) -> Result<Vec<u8>, CryptoError>,
    {
        let mut first_error = None;

        if let Some(current) = &mut self.current {
            let mut attempt = current.clone();
            match decrypt(&mut attempt) {
                Ok(plaintext) => {
                    *current = attempt;
                    return Ok(plaintext);
                },
                Err(e) => first_error = Some(e),
            }
        }

        for index in 0..self.previous.len() {
            let mut attempt = self.previous[index].clone();
            match decrypt(&mut attempt) {
                Ok(plaintext) => {
                    self.previous.remove(index);
                    self.promote(attempt);
                    return Ok(plaintext);
                },
                Err(e) => {
                    first_error.get_or_insert(e);
                },
            }
        }

        Err(first_error.unwrap_or(CryptoError::NoSession))
    }

    /// Decrypt with the state that came from `base_key`.
    ///
    /// Used for repeated pre-key messages of an agreement we already
    /// accepted.
    pub fn decrypt_with_base_key<F>(
        &mut self,
        base_key: &PublicKey,
        decrypt: F,
    ) -> Result<Vec<u8>, CryptoError>
    where
        F: FnOnce(&mut SessionState) -> Result<Vec<u8>, CryptoError>,
    {
        if let Some(current) = self.current.as_mut().filter(|s| &s.base_key == base_key) {
            let mut attempt = current.clone();
            let plaintext = decrypt(&mut attempt)?;
            *current = attempt;
            return Ok(plaintext);
        }

        let index = self
            .previous
            .iter()
            .position(|s| &s.base_key == base_key)
            .ok_or(CryptoError::NoSession)?;
        let mut attempt = self.previous[index].clone();
        let plaintext = decrypt(&mut attempt)?;
        self.previous.remove(index);
        self.promote(attempt);
        Ok(plaintext)
    }

    /// Serialize for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        ciborium::de::from_reader(bytes).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    fn states(&self) -> impl Iterator<Item = &SessionState> {
        self.current.iter().chain(self.previous.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::IdentityKeyPair;

    fn state(base: u8) -> SessionState {
        let local = IdentityKeyPair::from_seeds([1; 32], [2; 32]).public();
        let remote = IdentityKeyPair::from_seeds([3; 32], [4; 32]).public();
        SessionState {
            local_identity: local,
            remote_identity: remote,
            remote_registration_id: 9,
            base_key: PublicKey::from_bytes([base; 32]),
            associated_data: Vec::new(),
            sending: SymmetricRatchet::new(&[base; 32]),
            receiving: SymmetricRatchet::new(&[base.wrapping_add(1); 32]),
            pending_pre_key: None,
        }
    }

    #[test]
    fn promote_archives_and_bounds() {
        let mut record = SessionRecord::new(state(0));
        for base in 1..=(MAX_ARCHIVED_STATES as u8 + 2) {
            record.promote(state(base));
        }

        assert_eq!(record.archived_len(), MAX_ARCHIVED_STATES);
        assert!(!record.has_base_key(&PublicKey::from_bytes([0; 32])));
        assert!(record.has_base_key(&PublicKey::from_bytes([2; 32])));
    }

    #[test]
    fn failed_attempt_leaves_state_untouched() {
        let mut record = SessionRecord::new(state(0));

        let result = record.decrypt_with(|s| {
            s.receiving.advance()?;
            Err(CryptoError::DecryptionFailed { reason: "nope".to_string() })
        });

        assert!(result.is_err());
        assert_eq!(record.current().map(|s| s.receiving.generation()), Some(0));
    }

    #[test]
    fn archived_state_is_promoted_on_success() {
        let mut record = SessionRecord::new(state(0));
        record.promote(state(1));

        let old = PublicKey::from_bytes([0; 32]);
        let plaintext = record
            .decrypt_with(|s| {
                if s.base_key == old {
                    Ok(b"late".to_vec())
                } else {
                    Err(CryptoError::DecryptionFailed { reason: "wrong chain".to_string() })
                }
            })
            .unwrap();

        assert_eq!(plaintext, b"late");
        assert_eq!(record.current().map(|s| s.base_key), Some(old));
        assert_eq!(record.archived_len(), 1);
    }

    #[test]
    fn empty_record_has_no_session() {
        let mut record = SessionRecord::default();
        assert_eq!(record.decrypt_with(|_| Ok(Vec::new())), Err(CryptoError::NoSession));
    }

    #[test]
    fn record_survives_storage() {
        let mut record = SessionRecord::new(state(0));
        record.promote(state(1));

        let restored = SessionRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.archived_len(), 1);
        assert_eq!(restored.current().map(|s| s.base_key), Some(PublicKey::from_bytes([1; 32])));
    }
}
