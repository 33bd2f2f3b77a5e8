//! Session layer.
//!
//! Owns the mapping from peer to session record. Sessions are established
//! lazily on first encrypt, from the peer's published bundle, and every
//! ratchet mutation is written back to the key store before returning.
//!
//! # Concurrency
//!
//! All operations for one peer (encrypt, decrypt, establish, rebuild) run
//! under that peer's async mutex, so ratchet advancement never interleaves.
//! Different peers proceed independently. The lock is held across the bundle
//! fetch, which is what makes concurrent first-contact encrypts converge on
//! a single session.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use courier_crypto::{
    CiphertextMessage, CryptoEngine, CryptoError, IdentityKey, IdentityKeyPair, PreKeyMessage,
    SessionRecord,
};
use courier_proto::payloads::relay::CiphertextKind;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    config::SessionConfig,
    directory::{Ciphertext, KeyDirectory},
    env::Environment,
    error::SessionError,
    store::{KeyStore, Keyring, TrustDecision},
};

/// Device id of every peer. Multi-device is out of scope.
pub const DEVICE_ID: u32 = 1;

/// Store address of `peer`'s session record.
pub fn session_address(peer: &str) -> String {
    format!("{peer}:{DEVICE_ID}")
}

/// Summary of a peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Peer id
    pub peer: String,
    /// Identity the session was agreed with
    pub remote_identity: IdentityKey,
    /// Peer registration id
    pub remote_registration_id: u32,
    /// True until the peer's first reply; outgoing messages are initial-kind
    pub pending: bool,
}

/// Per-peer session management on top of a [`CryptoEngine`].
pub struct SessionLayer<S, C, E> {
    keyring: Keyring<S>,
    directory: Arc<dyn KeyDirectory>,
    engine: C,
    env: E,
    config: SessionConfig,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<S, C, E> SessionLayer<S, C, E>
where
    S: KeyStore,
    C: CryptoEngine,
    E: Environment,
{
    /// Create a session layer.
    pub fn new(
        store: S,
        directory: Arc<dyn KeyDirectory>,
        engine: C,
        env: E,
        config: SessionConfig,
    ) -> Self {
        Self {
            keyring: Keyring::new(store),
            directory,
            engine,
            env,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Typed key store access.
    pub fn keyring(&self) -> &Keyring<S> {
        &self.keyring
    }

    /// Whether a session record exists for `peer`.
    pub fn has_session(&self, peer: &str) -> Result<bool, SessionError> {
        Ok(self
            .keyring
            .session(&session_address(peer))?
            .is_some_and(|record| record.current().is_some()))
    }

    /// Existing session for `peer`, establishing one if needed.
    pub async fn ensure_session(&self, peer: &str) -> Result<SessionHandle, SessionError> {
        let lock = self.peer_lock(peer);
        let _guard = lock.lock().await;

        if let Some(handle) = self.current_handle(peer)? {
            return Ok(handle);
        }
        self.establish_locked(peer).await
    }

    /// Establish a fresh session from `peer`'s current bundle.
    ///
    /// An existing session is archived, not discarded, so messages already
    /// in flight under it still decrypt.
    pub async fn establish_session(&self, peer: &str) -> Result<SessionHandle, SessionError> {
        let lock = self.peer_lock(peer);
        let _guard = lock.lock().await;

        self.establish_locked(peer).await
    }

    /// Delete `peer`'s session and trust record, then establish anew.
    ///
    /// Both deletions and the establishment happen under the peer lock, so
    /// no other operation observes the intermediate state.
    pub async fn rebuild_session(&self, peer: &str) -> Result<SessionHandle, SessionError> {
        let lock = self.peer_lock(peer);
        let _guard = lock.lock().await;

        self.keyring.remove_session(&session_address(peer))?;
        self.keyring.remove_trust(peer)?;
        tracing::debug!(peer = %peer, "session and trust cleared for rebuild");

        self.establish_locked(peer).await
    }

    /// Rebuild in answer to a reset notice from `peer`.
    ///
    /// Like [`rebuild_session`](Self::rebuild_session), except the current
    /// state survives as an archive: it is the agreement the notice arrived
    /// under, and the peer keeps sending initial messages on it until our
    /// reply reaches them.
    pub async fn rebuild_session_keeping_current(
        &self,
        peer: &str,
    ) -> Result<SessionHandle, SessionError> {
        let lock = self.peer_lock(peer);
        let _guard = lock.lock().await;

        let address = session_address(peer);
        let retained = self
            .keyring
            .session(&address)?
            .and_then(|record| record.current().cloned());

        self.keyring.remove_session(&address)?;
        self.keyring.remove_trust(peer)?;
        if let Some(state) = retained {
            self.keyring.put_session(&address, &SessionRecord::new(state))?;
        }
        tracing::debug!(peer = %peer, "trust cleared for rebuild, notice session retained");

        self.establish_locked(peer).await
    }

    /// Encrypt `plaintext` for `peer`.
    ///
    /// Advances and persists the sending chain: encrypting the same
    /// plaintext twice yields two different ciphertexts.
    pub async fn encrypt(&self, peer: &str, plaintext: &[u8]) -> Result<Ciphertext, SessionError> {
        let lock = self.peer_lock(peer);
        let _guard = lock.lock().await;

        if self.current_handle(peer)?.is_none() {
            self.establish_locked(peer).await?;
        }

        let address = session_address(peer);
        let mut record = self.keyring.session(&address)?.unwrap_or_default();
        let state = record.current_mut().ok_or(CryptoError::NoSession)?;

        let message = self.engine.encrypt(state, plaintext, self.env.random_array())?;
        self.keyring.put_session(&address, &record)?;

        Ok(Ciphertext { kind: message.kind(), body: message.encode()? })
    }

    /// Decrypt a ciphertext of `kind` from `peer`.
    ///
    /// Every failure to produce plaintext from the peer's bytes surfaces as
    /// [`SessionError::DecryptionFailed`] (or `IdentityMismatch` for an
    /// initial message under an unexpected identity). Local state is left
    /// untouched on failure.
    pub async fn decrypt(
        &self,
        peer: &str,
        body: &[u8],
        kind: CiphertextKind,
    ) -> Result<Vec<u8>, SessionError> {
        let lock = self.peer_lock(peer);
        let _guard = lock.lock().await;

        let message =
            CiphertextMessage::decode(kind, body).map_err(|e| decryption_failed(peer, &e))?;

        match message {
            CiphertextMessage::Ratchet(message) => {
                let address = session_address(peer);
                let mut record = self.keyring.session(&address)?.ok_or_else(|| {
                    SessionError::DecryptionFailed {
                        peer: peer.to_string(),
                        reason: "no session".to_string(),
                    }
                })?;

                let plaintext = record
                    .decrypt_with(|state| self.engine.decrypt(state, &message))
                    .map_err(|e| decryption_failed(peer, &e))?;
                self.keyring.put_session(&address, &record)?;
                Ok(plaintext)
            },
            CiphertextMessage::PreKey(message) => self.decrypt_initial(peer, &message),
        }
    }

    /// Wipe every session, trust record and local key.
    ///
    /// Used on logout and account wipe.
    pub fn clear_all_sessions(&self) -> Result<(), SessionError> {
        self.keyring.wipe()?;
        self.lock_table().clear();
        tracing::info!("all sessions and local keys wiped");
        Ok(())
    }

    async fn establish_locked(&self, peer: &str) -> Result<SessionHandle, SessionError> {
        let (identity, registration_id) = self.local_identity()?;

        let data = self.directory.fetch_key_bundle(peer).await.map_err(|source| {
            SessionError::PeerUnreachable { peer: peer.to_string(), source }
        })?;
        let bundle = self.engine.process_bundle(&data).map_err(|e| {
            tracing::warn!(peer = %peer, error = %e, "rejected key bundle");
            SessionError::InvalidBundle { peer: peer.to_string(), reason: e.to_string() }
        })?;

        if bundle.one_time_pre_key.is_none() {
            if self.config.require_one_time_pre_key {
                return Err(SessionError::NoPreKeyAvailable { peer: peer.to_string() });
            }
            tracing::warn!(
                peer = %peer,
                "bundle has no one-time pre-key, establishing on signed pre-key only"
            );
        }

        if self.keyring.check_trust(peer, &bundle.identity_key)? == TrustDecision::Mismatch {
            tracing::warn!(peer = %peer, "published identity key differs from trusted key");
            return Err(SessionError::IdentityMismatch { peer: peer.to_string() });
        }

        let state = self.engine.initiate_session(
            &identity,
            registration_id,
            &bundle,
            self.env.random_array(),
        )?;

        let address = session_address(peer);
        let mut record = self.keyring.session(&address)?.unwrap_or_default();
        record.promote(state);
        self.keyring.put_session(&address, &record)?;
        self.keyring.save_trust(peer, &bundle.identity_key, self.env.wall_clock_millis())?;

        tracing::info!(
            peer = %peer,
            signed_pre_key = bundle.signed_pre_key.id,
            one_time_pre_key = ?bundle.one_time_pre_key.map(|pk| pk.id),
            "session established"
        );

        Ok(SessionHandle {
            peer: peer.to_string(),
            remote_identity: bundle.identity_key,
            remote_registration_id: bundle.registration_id,
            pending: true,
        })
    }

    fn decrypt_initial(&self, peer: &str, message: &PreKeyMessage) -> Result<Vec<u8>, SessionError> {
        if self.keyring.check_trust(peer, &message.identity_key)? == TrustDecision::Mismatch {
            tracing::warn!(peer = %peer, "initial message under untrusted identity key");
            return Err(SessionError::IdentityMismatch { peer: peer.to_string() });
        }

        let address = session_address(peer);
        let mut record = self.keyring.session(&address)?.unwrap_or_default();

        // Repeat of an agreement we already accepted: no pre-key is consumed
        if record.has_base_key(&message.base_key) {
            let plaintext = record
                .decrypt_with_base_key(&message.base_key, |state| {
                    self.engine.decrypt(state, &message.message)
                })
                .map_err(|e| decryption_failed(peer, &e))?;
            self.keyring.put_session(&address, &record)?;
            self.keyring.save_trust(peer, &message.identity_key, self.env.wall_clock_millis())?;
            return Ok(plaintext);
        }

        let (identity, _) = self.local_identity()?;
        let signed = self.keyring.signed_pre_key(message.signed_pre_key_id)?.ok_or_else(|| {
            SessionError::DecryptionFailed {
                peer: peer.to_string(),
                reason: format!("unknown signed pre-key {}", message.signed_pre_key_id),
            }
        })?;
        let one_time = match message.one_time_pre_key_id {
            Some(id) => Some(self.keyring.pre_key(id)?.ok_or_else(|| {
                SessionError::DecryptionFailed {
                    peer: peer.to_string(),
                    reason: format!("one-time pre-key {id} already consumed"),
                }
            })?),
            None => None,
        };

        let mut state = self
            .engine
            .accept_session(&identity, &signed, one_time.as_ref(), message)
            .map_err(|e| decryption_failed(peer, &e))?;
        let plaintext = self
            .engine
            .decrypt(&mut state, &message.message)
            .map_err(|e| decryption_failed(peer, &e))?;

        record.promote(state);
        self.keyring.put_session(&address, &record)?;
        if let Some(id) = message.one_time_pre_key_id {
            self.keyring.remove_pre_key(id)?;
        }
        self.keyring.save_trust(peer, &message.identity_key, self.env.wall_clock_millis())?;

        tracing::info!(
            peer = %peer,
            signed_pre_key = message.signed_pre_key_id,
            one_time_pre_key = ?message.one_time_pre_key_id,
            "accepted incoming session"
        );
        Ok(plaintext)
    }

    fn current_handle(&self, peer: &str) -> Result<Option<SessionHandle>, SessionError> {
        let record = self.keyring.session(&session_address(peer))?;
        Ok(record.as_ref().and_then(SessionRecord::current).map(|state| SessionHandle {
            peer: peer.to_string(),
            remote_identity: *state.remote_identity(),
            remote_registration_id: state.remote_registration_id(),
            pending: state.is_pending(),
        }))
    }

    fn local_identity(&self) -> Result<(IdentityKeyPair, u32), SessionError> {
        let identity = self.keyring.identity()?.ok_or(SessionError::NotRegistered)?;
        let registration_id =
            self.keyring.registration_id()?.ok_or(SessionError::NotRegistered)?;
        Ok((identity, registration_id))
    }

    fn peer_lock(&self, peer: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.lock_table().entry(peer.to_string()).or_default())
    }

    #[allow(clippy::expect_used, reason = "poisoning means a holder panicked mid-update")]
    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().expect("session lock table poisoned")
    }
}

fn decryption_failed(peer: &str, err: &CryptoError) -> SessionError {
    SessionError::DecryptionFailed { peer: peer.to_string(), reason: err.to_string() }
}
