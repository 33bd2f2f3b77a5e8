//! Session recovery.
//!
//! A session is desynchronized when the peer's messages stop decrypting:
//! lost state on either side, a reinstall, or a replay. Recovery tears the
//! session down together with its trust record, builds a new one from the
//! peer's current bundle, and tells the peer with an encrypted reset notice
//! so it can do the same. The receiving side archives the session the
//! notice arrived on, since the peer keeps using it until our reply lands.
//!
//! Per peer the coordinator is either idle or has a reset in flight:
//!
//! ```text
//! Idle ──initiate_reset──> ResetPending ──(success | failure)──> Idle
//! ```
//!
//! Three in-memory guards keep resets from storming:
//!
//! - cooldown: a second outgoing reset within the cooldown is skipped
//! - dedup: an incoming reset within the dedup window of the last one is
//!   ignored (the relay delivers at least once)
//! - tried envelopes: an envelope id triggers recovery at most once
//!
//! None of this state survives a restart.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use courier_crypto::CryptoEngine;
use courier_proto::payloads::content::{ResetNotice, SealedContent};

use crate::{
    config::RecoveryConfig,
    contacts::{Contact, ContactBook, ContactStatus},
    directory::MessageSink,
    env::Environment,
    error::RecoveryError,
    expiring::{ExpiringMap, ExpiringSet},
    session::SessionLayer,
    store::KeyStore,
};

/// Recovery phase for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPhase {
    /// No reset running
    Idle,
    /// A reset is being performed
    ResetPending,
}

struct ResetState<I> {
    /// Peers with an outgoing reset started within the cooldown
    started: ExpiringMap<String, u32, I>,
    /// Outgoing reset attempts per peer since the last success
    attempts: HashMap<String, u32>,
    /// Peers whose incoming reset completed within the dedup window
    completed: ExpiringSet<String, I>,
    /// Envelope ids that already triggered recovery
    tried: ExpiringSet<String, I>,
    /// Peers with a reset in flight
    in_flight: HashSet<String>,
}

/// Detects and repairs desynchronized sessions.
pub struct SessionRecoveryCoordinator<S, C, E: Environment> {
    sessions: Arc<SessionLayer<S, C, E>>,
    sink: Arc<dyn MessageSink>,
    contacts: Arc<dyn ContactBook>,
    env: E,
    config: RecoveryConfig,
    state: Mutex<ResetState<E::Instant>>,
}

impl<S, C, E> SessionRecoveryCoordinator<S, C, E>
where
    S: KeyStore,
    C: CryptoEngine,
    E: Environment,
{
    /// Create a coordinator.
    pub fn new(
        sessions: Arc<SessionLayer<S, C, E>>,
        sink: Arc<dyn MessageSink>,
        contacts: Arc<dyn ContactBook>,
        env: E,
        config: RecoveryConfig,
    ) -> Self {
        let state = ResetState {
            started: ExpiringMap::new(config.cooldown),
            attempts: HashMap::new(),
            completed: ExpiringSet::new(config.dedup_window),
            tried: ExpiringSet::new(config.tried_envelope_ttl),
            in_flight: HashSet::new(),
        };
        Self { sessions, sink, contacts, env, config, state: Mutex::new(state) }
    }

    /// Reset our session with `peer` and notify them.
    ///
    /// Returns `false` without doing anything if a reset for `peer` started
    /// within the cooldown, and `false` if any step failed. Failures are
    /// logged; retrying after the cooldown is safe.
    pub async fn initiate_reset(&self, peer: &str, reason: &str) -> bool {
        let attempt = {
            let now = self.env.now();
            let mut state = self.state();
            if state.started.contains(&peer.to_string(), now) {
                tracing::debug!(peer = %peer, reason, "reset skipped, cooldown active");
                return false;
            }
            let attempt = state.attempts.entry(peer.to_string()).or_default();
            *attempt += 1;
            let attempt = *attempt;
            state.started.insert(peer.to_string(), attempt, now);
            state.in_flight.insert(peer.to_string());
            attempt
        };

        tracing::info!(peer = %peer, reason, attempt, "initiating session reset");
        let result = self.reset_and_notify(peer, reason).await;

        let mut state = self.state();
        state.in_flight.remove(peer);
        match result {
            Ok(()) => {
                state.attempts.remove(peer);
                tracing::info!(peer = %peer, "session reset complete");
                true
            },
            Err(e) => {
                tracing::warn!(peer = %peer, attempt, error = %e, "session reset failed");
                false
            },
        }
    }

    /// Apply a reset notice received from `peer`.
    ///
    /// Returns `Ok(false)` for a duplicate within the dedup window. Errors
    /// propagate: the inbound pipeline has no further fallback.
    pub async fn handle_incoming_reset(
        &self,
        peer: &str,
        notice: &ResetNotice,
    ) -> Result<bool, RecoveryError> {
        {
            let now = self.env.now();
            let mut state = self.state();
            if state.completed.contains(&peer.to_string(), now) {
                tracing::debug!(peer = %peer, "duplicate reset notice ignored");
                return Ok(false);
            }
            state.completed.insert(peer.to_string(), now);
            state.in_flight.insert(peer.to_string());
        }

        tracing::info!(peer = %peer, reason = %notice.reason, "peer reset its session");
        let result = self.apply_incoming(peer, notice).await;

        let mut state = self.state();
        state.in_flight.remove(peer);
        if result.is_err() {
            // Let a redelivery of the same notice try again
            state.completed.remove(&peer.to_string());
        }
        result.map(|()| true)
    }

    /// Whether `envelope_id` already triggered recovery.
    pub fn has_tried_envelope(&self, envelope_id: &str) -> bool {
        let now = self.env.now();
        self.state().tried.contains(&envelope_id.to_string(), now)
    }

    /// Remember that `envelope_id` triggered recovery.
    pub fn mark_envelope_tried(&self, envelope_id: &str) {
        let now = self.env.now();
        self.state().tried.insert(envelope_id.to_string(), now);
    }

    /// Current phase for `peer`.
    pub fn phase(&self, peer: &str) -> ResetPhase {
        if self.state().in_flight.contains(peer) {
            ResetPhase::ResetPending
        } else {
            ResetPhase::Idle
        }
    }

    async fn reset_and_notify(&self, peer: &str, reason: &str) -> Result<(), RecoveryError> {
        self.sessions.rebuild_session(peer).await?;

        // They are resetting with us, so they still consider us a contact
        if self.contacts.contact(peer).map_err(RecoveryError::Contacts)?.is_none() {
            tracing::info!(peer = %peer, "restoring missing contact");
            self.contacts
                .upsert(Contact {
                    peer: peer.to_string(),
                    display_name: peer.to_string(),
                    status: ContactStatus::Accepted,
                })
                .map_err(RecoveryError::Contacts)?;
        }

        let notice = SealedContent::SessionReset(ResetNotice {
            sender_name: self.config.display_name.clone(),
            reason: reason.to_string(),
            sent_at_ms: self.env.wall_clock_millis(),
        });
        let plaintext = notice.to_bytes().map_err(|e| RecoveryError::Encoding(e.to_string()))?;

        let ciphertext = self.sessions.encrypt(peer, &plaintext).await?;
        let message_id = self.sink.deliver(peer, ciphertext).await?;
        tracing::debug!(peer = %peer, message_id = %message_id, "reset notice sent");
        Ok(())
    }

    async fn apply_incoming(&self, peer: &str, notice: &ResetNotice) -> Result<(), RecoveryError> {
        self.sessions.rebuild_session_keeping_current(peer).await?;

        let existing = self.contacts.contact(peer).map_err(RecoveryError::Contacts)?;
        let display_name = if notice.sender_name.is_empty() {
            existing.as_ref().map_or_else(|| peer.to_string(), |c| c.display_name.clone())
        } else {
            notice.sender_name.clone()
        };
        if existing.as_ref().is_none_or(|c| c.status != ContactStatus::Accepted) {
            tracing::info!(peer = %peer, "contact upgraded to accepted by reset");
        }
        self.contacts
            .upsert(Contact { peer: peer.to_string(), display_name, status: ContactStatus::Accepted })
            .map_err(RecoveryError::Contacts)
    }

    #[allow(clippy::expect_used, reason = "poisoning means a holder panicked mid-update")]
    fn state(&self) -> MutexGuard<'_, ResetState<E::Instant>> {
        self.state.lock().expect("recovery state lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use courier_crypto::{IdentityKeyPair, PreKeyRecord, RatchetEngine, SignedPreKeyRecord};
    use courier_proto::payloads::{
        keys::{KeyBundleData, KeyBundlePublish},
        relay::CiphertextKind,
    };

    use super::*;
    use crate::{
        config::SessionConfig,
        contacts::MemoryContactBook,
        directory::{Ciphertext, KeyDirectory},
        error::{DeliveryError, DirectoryError},
        store::{Keyring, MemoryKeyStore},
        testing::TestEnv,
    };

    /// Hands out a fresh bundle on every fetch, from a stock of one-time keys.
    struct BobDirectory {
        identity: IdentityKeyPair,
        signed: SignedPreKeyRecord,
        next_one_time: Mutex<u32>,
        reachable: Mutex<bool>,
    }

    #[async_trait]
    impl KeyDirectory for BobDirectory {
        async fn fetch_key_bundle(&self, peer: &str) -> Result<KeyBundleData, DirectoryError> {
            if !*self.reachable.lock().unwrap() {
                return Err(DirectoryError::Unavailable(format!("{peer} unreachable")));
            }
            let mut next = self.next_one_time.lock().unwrap();
            *next += 1;
            Ok(KeyBundleData {
                identity_key: self.identity.public().to_bytes().to_vec(),
                registration_id: 2,
                signed_pre_key: self.signed.to_data(),
                one_time_pre_key: Some(PreKeyRecord::generate(*next, [*next as u8; 32]).to_data()),
            })
        }

        async fn publish_key_bundle(&self, _: KeyBundlePublish) -> Result<u32, DirectoryError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct CapturingSink {
        sent: Mutex<Vec<(String, Ciphertext)>>,
    }

    #[async_trait]
    impl MessageSink for CapturingSink {
        async fn deliver(&self, peer: &str, ciphertext: Ciphertext) -> Result<String, DeliveryError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((peer.to_string(), ciphertext));
            Ok(format!("msg-{}", sent.len()))
        }
    }

    struct Fixture {
        env: TestEnv,
        directory: Arc<BobDirectory>,
        sink: Arc<CapturingSink>,
        contacts: MemoryContactBook,
        sessions: Arc<SessionLayer<MemoryKeyStore, RatchetEngine, TestEnv>>,
        recovery: SessionRecoveryCoordinator<MemoryKeyStore, RatchetEngine, TestEnv>,
    }

    fn fixture() -> Fixture {
        let env = TestEnv::new(11);
        let bob = IdentityKeyPair::from_seeds([20; 32], [21; 32]);
        let directory = Arc::new(BobDirectory {
            signed: SignedPreKeyRecord::generate(1, &bob, [22; 32], 0),
            identity: bob,
            next_one_time: Mutex::new(0),
            reachable: Mutex::new(true),
        });

        let store = MemoryKeyStore::new();
        let ring = Keyring::new(store.clone());
        ring.put_identity(&IdentityKeyPair::from_seeds([1; 32], [2; 32])).unwrap();
        ring.put_registration_id(1).unwrap();

        let sessions = Arc::new(SessionLayer::new(
            store,
            directory.clone(),
            RatchetEngine,
            env.clone(),
            SessionConfig::default(),
        ));
        let sink = Arc::new(CapturingSink::default());
        let contacts = MemoryContactBook::new();
        let recovery = SessionRecoveryCoordinator::new(
            Arc::clone(&sessions),
            sink.clone(),
            Arc::new(contacts.clone()),
            env.clone(),
            RecoveryConfig { display_name: "Alice".to_string(), ..RecoveryConfig::default() },
        );

        Fixture { env, directory, sink, contacts, sessions, recovery }
    }

    fn notice(name: &str) -> ResetNotice {
        ResetNotice {
            sender_name: name.to_string(),
            reason: "decryption_failure".to_string(),
            sent_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn second_reset_within_cooldown_is_skipped() {
        let f = fixture();

        assert!(f.recovery.initiate_reset("bob", "decryption_failure").await);
        assert!(!f.recovery.initiate_reset("bob", "decryption_failure").await);
        assert_eq!(f.sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_allowed_again_after_cooldown() {
        let f = fixture();
        assert!(f.recovery.initiate_reset("bob", "decryption_failure").await);

        f.env.advance(Duration::from_secs(30));
        assert!(f.recovery.initiate_reset("bob", "decryption_failure").await);
        assert_eq!(*f.directory.next_one_time.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn reset_sends_encrypted_notice_on_new_session() {
        let f = fixture();
        f.recovery.initiate_reset("bob", "decryption_failure").await;

        let sent = f.sink.sent.lock().unwrap();
        let (peer, ciphertext) = &sent[0];
        assert_eq!(peer, "bob");
        assert_eq!(ciphertext.kind, CiphertextKind::Initial);
        assert!(f.sessions.has_session("bob").unwrap());
    }

    #[tokio::test]
    async fn reset_restores_missing_contact() {
        let f = fixture();
        f.recovery.initiate_reset("bob", "decryption_failure").await;

        let bob = f.contacts.contact("bob").unwrap().unwrap();
        assert_eq!(bob.status, ContactStatus::Accepted);
    }

    #[tokio::test]
    async fn failed_reset_returns_false_and_keeps_cooldown() {
        let f = fixture();
        *f.directory.reachable.lock().unwrap() = false;

        assert!(!f.recovery.initiate_reset("bob", "decryption_failure").await);
        assert_eq!(f.recovery.phase("bob"), ResetPhase::Idle);

        *f.directory.reachable.lock().unwrap() = true;
        assert!(!f.recovery.initiate_reset("bob", "decryption_failure").await);
        f.env.advance(Duration::from_secs(31));
        assert!(f.recovery.initiate_reset("bob", "decryption_failure").await);
    }

    #[tokio::test]
    async fn reset_clears_stale_trust() {
        let f = fixture();
        let ring = f.sessions.keyring();
        let stale = IdentityKeyPair::from_seeds([99; 32], [98; 32]).public();
        ring.save_trust("bob", &stale, 0).unwrap();

        assert!(f.recovery.initiate_reset("bob", "identity_mismatch").await);
        let trust = ring.trust("bob").unwrap().unwrap();
        assert_eq!(trust.identity_key, f.directory.identity.public());
    }

    #[tokio::test]
    async fn incoming_reset_is_deduplicated() {
        let f = fixture();

        assert!(f.recovery.handle_incoming_reset("bob", &notice("Bob")).await.unwrap());
        assert!(!f.recovery.handle_incoming_reset("bob", &notice("Bob")).await.unwrap());
        assert_eq!(*f.directory.next_one_time.lock().unwrap(), 1, "rebuilt exactly once");

        f.env.advance(Duration::from_secs(5));
        assert!(f.recovery.handle_incoming_reset("bob", &notice("Bob")).await.unwrap());
    }

    #[tokio::test]
    async fn incoming_reset_archives_the_session_it_arrived_on() {
        let f = fixture();
        f.sessions.ensure_session("bob").await.unwrap();
        let address = crate::session::session_address("bob");
        let ring = f.sessions.keyring();
        let before = ring.session(&address).unwrap().unwrap();
        let base_key = *before.current().unwrap().base_key();

        f.recovery.handle_incoming_reset("bob", &notice("Bob")).await.unwrap();

        let after = ring.session(&address).unwrap().unwrap();
        assert_eq!(after.archived_len(), 1);
        assert!(after.has_base_key(&base_key));
        assert_ne!(after.current().map(|state| *state.base_key()), Some(base_key));
    }

    #[tokio::test]
    async fn incoming_reset_upgrades_contact() {
        let f = fixture();
        f.contacts
            .upsert(Contact {
                peer: "bob".to_string(),
                display_name: "bob".to_string(),
                status: ContactStatus::Pending,
            })
            .unwrap();

        f.recovery.handle_incoming_reset("bob", &notice("Bobby")).await.unwrap();

        let bob = f.contacts.contact("bob").unwrap().unwrap();
        assert_eq!(bob.display_name, "Bobby");
        assert_eq!(bob.status, ContactStatus::Accepted);
    }

    #[tokio::test]
    async fn incoming_reset_failure_propagates_and_allows_retry() {
        let f = fixture();
        *f.directory.reachable.lock().unwrap() = false;

        let err = f.recovery.handle_incoming_reset("bob", &notice("Bob")).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Session(_)));

        *f.directory.reachable.lock().unwrap() = true;
        assert!(f.recovery.handle_incoming_reset("bob", &notice("Bob")).await.unwrap());
    }

    #[test]
    fn tried_envelopes_expire() {
        let f = fixture();
        f.recovery.mark_envelope_tried("env-1");

        assert!(f.recovery.has_tried_envelope("env-1"));
        f.env.advance(Duration::from_secs(60));
        assert!(!f.recovery.has_tried_envelope("env-1"));
    }
}
