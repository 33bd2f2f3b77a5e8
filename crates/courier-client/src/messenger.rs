//! Composition root.
//!
//! [`Messenger`] builds every component once, wires them together, and runs
//! the inbound pipeline:
//!
//! ```text
//! relay ─> Transport ─(envelope, auto-ack)─> SessionLayer::decrypt
//!                                              │ ok             │ desync
//!                                              ↓                ↓
//!                                         SealedContent    initiate_reset
//!                                 application │   │ reset   (once per envelope)
//!                                             ↓   └──> handle_incoming_reset
//!                                           inbox
//! ```
//!
//! An initial message under an identity key other than the trusted one is
//! neither a desync nor a message: it reaches the inbox as
//! [`InboundEvent::IdentityChanged`] and trust stays as it was.
//!
//! After every successful connect the pipeline also tops up the pre-key
//! supply.

use std::sync::{Arc, Mutex};

use courier_core::{
    ContactBook, Environment, KeyDirectory, KeyStore, MessageSink, PreKeyStatus,
    PreKeySupplyManager, Registration, Replenishment, SessionHandle, SessionLayer,
    SessionError, SessionRecoveryCoordinator,
};
use courier_crypto::CryptoEngine;
use courier_proto::payloads::{content::SealedContent, relay::Envelope};
use tokio::sync::mpsc;

use crate::{
    config::ClientConfig,
    credentials::CredentialProvider,
    directory::RelayDirectory,
    error::MessengerError,
    events::{EventKind, Subscription, TransportEvent},
    transport::{Connector, Transport},
};

/// Decrypted application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Relay envelope id
    pub envelope_id: String,
    /// Sender account id
    pub sender: String,
    /// Application payload
    pub body: Vec<u8>,
    /// Sender wall-clock time, Unix milliseconds
    pub timestamp: u64,
}

/// What the inbound pipeline hands to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A decrypted application message
    Message(InboundMessage),

    /// A peer presented an identity key that differs from the trusted one.
    ///
    /// The envelope was dropped and the trust record is untouched. Call
    /// [`Messenger::accept_identity_change`] once the user has verified the
    /// new key.
    IdentityChanged {
        /// Peer whose key changed
        peer: String,
        /// Envelope that carried the new key
        envelope_id: String,
    },
}

enum Work {
    Envelope(Envelope),
    Connected,
}

struct Inner<S, C, E: Environment, N> {
    transport: Transport<N, E>,
    sessions: Arc<SessionLayer<S, C, E>>,
    pre_keys: PreKeySupplyManager<S, C, E>,
    recovery: SessionRecoveryCoordinator<S, C, E>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// One device's messaging stack.
///
/// Cheap to clone; clones share every component.
pub struct Messenger<S, C, E: Environment, N> {
    inner: Arc<Inner<S, C, E, N>>,
}

impl<S, C, E: Environment, N> Clone for Messenger<S, C, E, N> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S, C, E, N> Messenger<S, C, E, N>
where
    S: KeyStore,
    C: CryptoEngine + Clone,
    E: Environment,
    N: Connector,
{
    /// Wire up a messenger. Nothing touches the network until
    /// [`connect`](Self::connect).
    pub fn new(
        config: ClientConfig,
        store: S,
        engine: C,
        env: E,
        connector: N,
        credentials: Arc<dyn CredentialProvider>,
        contacts: Arc<dyn ContactBook>,
    ) -> Self {
        let transport = Transport::new(connector, credentials, env.clone(), config.transport);
        let directory: Arc<dyn KeyDirectory> = Arc::new(RelayDirectory::new(transport.clone()));

        let sessions = Arc::new(SessionLayer::new(
            store.clone(),
            Arc::clone(&directory),
            engine.clone(),
            env.clone(),
            config.session,
        ));
        let pre_keys =
            PreKeySupplyManager::new(store, directory, engine, env.clone(), config.pre_keys);

        let sink: Arc<dyn MessageSink> = Arc::new(transport.clone());
        let recovery = SessionRecoveryCoordinator::new(
            Arc::clone(&sessions),
            sink,
            contacts,
            env,
            config.recovery,
        );

        Self {
            inner: Arc::new(Inner {
                transport,
                sessions,
                pre_keys,
                recovery,
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start the inbound pipeline. Decrypted application messages and
    /// identity alerts arrive on the returned channel.
    ///
    /// The pipeline runs until [`stop`](Self::stop) or
    /// [`logout`](Self::logout). Envelopes are processed one at a time, in
    /// arrival order.
    pub fn start(&self) -> mpsc::UnboundedReceiver<InboundEvent> {
        let (work_tx, mut work_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let envelopes = {
            let work_tx = work_tx.clone();
            self.transport().subscribe(EventKind::Envelope, move |event| {
                if let TransportEvent::Envelope(envelope) = event {
                    let _ = work_tx.send(Work::Envelope(envelope.clone()));
                }
            })
        };
        let connects = self.transport().subscribe(EventKind::Connected, move |_| {
            let _ = work_tx.send(Work::Connected);
        });
        self.subscriptions().extend([envelopes, connects]);

        let messenger = self.clone();
        tokio::spawn(async move {
            while let Some(work) = work_rx.recv().await {
                match work {
                    Work::Envelope(envelope) => match messenger.handle_envelope(&envelope).await {
                        Ok(Some(event)) => {
                            if inbox_tx.send(event).is_err() {
                                tracing::debug!("inbox dropped, discarding event");
                            }
                        },
                        Ok(None) => {},
                        Err(e) => {
                            tracing::warn!(envelope = %envelope.id, from = %envelope.source_id, error = %e, "inbound message dropped");
                        },
                    },
                    Work::Connected => messenger.on_connected().await,
                }
            }
            tracing::debug!("inbound pipeline stopped");
        });

        inbox_rx
    }

    /// Stop the inbound pipeline.
    pub fn stop(&self) {
        let subscriptions: Vec<_> = self.subscriptions().drain(..).collect();
        for subscription in subscriptions {
            self.transport().unsubscribe(subscription);
        }
    }

    /// Process one delivered envelope.
    ///
    /// Returns the application message or an identity alert, or `None` if
    /// the envelope was a reset notice or could not be decrypted.
    /// Undecryptable envelopes start session recovery, once per envelope id.
    /// A redelivered envelope that was already decrypted is dropped without
    /// recovery.
    ///
    /// # Errors
    ///
    /// Failures with no recovery path: local store errors, a failed
    /// incoming reset, undecodable content.
    pub async fn handle_envelope(
        &self,
        envelope: &Envelope,
    ) -> Result<Option<InboundEvent>, MessengerError> {
        let peer = envelope.source_id.as_str();

        let plaintext = match self.sessions().decrypt(peer, &envelope.ciphertext, envelope.kind).await {
            Ok(plaintext) => plaintext,
            Err(e) if e.triggers_recovery() => {
                if self.recovery().has_tried_envelope(&envelope.id) {
                    tracing::debug!(envelope = %envelope.id, peer, "envelope already triggered recovery");
                    return Ok(None);
                }
                tracing::warn!(envelope = %envelope.id, peer, error = %e, "undecryptable envelope, recovering session");
                self.recovery().mark_envelope_tried(&envelope.id);
                self.recovery().initiate_reset(peer, &e.to_string()).await;
                return Ok(None);
            },
            Err(SessionError::IdentityMismatch { .. }) => {
                tracing::warn!(envelope = %envelope.id, peer, "peer identity changed, envelope dropped");
                return Ok(Some(InboundEvent::IdentityChanged {
                    peer: peer.to_string(),
                    envelope_id: envelope.id.clone(),
                }));
            },
            Err(e) => return Err(e.into()),
        };
        // A redelivery (lost ack) fails as a replay; it must not start a reset
        self.recovery().mark_envelope_tried(&envelope.id);

        match SealedContent::from_bytes(&plaintext) {
            Ok(SealedContent::Application(body)) => Ok(Some(InboundEvent::Message(InboundMessage {
                envelope_id: envelope.id.clone(),
                sender: peer.to_string(),
                body,
                timestamp: envelope.timestamp,
            }))),
            Ok(SealedContent::SessionReset(notice)) => {
                self.recovery().handle_incoming_reset(peer, &notice).await?;
                Ok(None)
            },
            Err(e) => Err(MessengerError::Content(e.to_string())),
        }
    }

    /// Connect to the relay.
    pub async fn connect(&self) -> Result<(), MessengerError> {
        Ok(self.transport().connect().await?)
    }

    /// Disconnect from the relay.
    pub fn disconnect(&self) {
        self.transport().disconnect();
    }

    /// True while the relay link is open.
    pub fn is_connected(&self) -> bool {
        self.transport().is_connected()
    }

    /// Create and publish this device's identity if it has none.
    pub async fn register(&self) -> Result<Registration, MessengerError> {
        Ok(self.inner.pre_keys.register().await?)
    }

    /// Whether this device has an identity.
    pub fn is_registered(&self) -> Result<bool, MessengerError> {
        let identity = self.sessions().keyring().identity().map_err(SessionError::from)?;
        Ok(identity.is_some())
    }

    /// Encrypt `body` for `peer` and hand it to the relay. Returns the client
    /// message id carried by the relay's ack event.
    pub async fn send(&self, peer: &str, body: &[u8]) -> Result<String, MessengerError> {
        let content = SealedContent::Application(body.to_vec())
            .to_bytes()
            .map_err(|e| MessengerError::Content(e.to_string()))?;
        let ciphertext = self.sessions().encrypt(peer, &content).await?;
        Ok(self.transport().send_data(peer, ciphertext).await?)
    }

    /// Whether a session with `peer` exists.
    pub fn has_session(&self, peer: &str) -> Result<bool, MessengerError> {
        Ok(self.sessions().has_session(peer)?)
    }

    /// Existing session with `peer`, establishing one if needed.
    pub async fn ensure_session(&self, peer: &str) -> Result<SessionHandle, MessengerError> {
        Ok(self.sessions().ensure_session(peer).await?)
    }

    /// One-time pre-key supply.
    pub fn pre_key_status(&self) -> Result<PreKeyStatus, MessengerError> {
        Ok(self.inner.pre_keys.status()?)
    }

    /// Top up the pre-key supply if it is low.
    pub async fn replenish_pre_keys(&self) -> Result<Replenishment, MessengerError> {
        Ok(self.inner.pre_keys.replenish().await?)
    }

    /// Reset the session with `peer`. See
    /// [`SessionRecoveryCoordinator::initiate_reset`].
    pub async fn initiate_reset(&self, peer: &str, reason: &str) -> bool {
        self.recovery().initiate_reset(peer, reason).await
    }

    /// Trust `peer`'s new identity key.
    ///
    /// Rebuilds the session from the peer's current bundle and sends them a
    /// reset notice. Returns `false` if the reset was skipped or failed.
    pub async fn accept_identity_change(&self, peer: &str) -> bool {
        tracing::info!(peer = %peer, "accepting changed identity");
        self.recovery().initiate_reset(peer, "identity_accepted").await
    }

    /// Stop the pipeline, disconnect, and wipe every session and local key.
    pub fn logout(&self) -> Result<(), MessengerError> {
        self.stop();
        self.disconnect();
        self.sessions().clear_all_sessions()?;
        Ok(())
    }

    /// The relay transport.
    pub fn transport(&self) -> &Transport<N, E> {
        &self.inner.transport
    }

    /// The session layer.
    pub fn sessions(&self) -> &SessionLayer<S, C, E> {
        &self.inner.sessions
    }

    /// The recovery coordinator.
    pub fn recovery(&self) -> &SessionRecoveryCoordinator<S, C, E> {
        &self.inner.recovery
    }

    async fn on_connected(&self) {
        match self.is_registered() {
            Ok(true) => match self.inner.pre_keys.replenish().await {
                Ok(Replenishment { replenished: true, uploaded }) => {
                    tracing::info!(uploaded, "pre-keys replenished after connect");
                },
                Ok(_) => tracing::debug!("pre-key supply sufficient"),
                Err(e) => tracing::warn!(error = %e, "pre-key replenishment failed"),
            },
            Ok(false) => tracing::debug!("not registered, skipping pre-key replenishment"),
            Err(e) => tracing::warn!(error = %e, "cannot read local identity"),
        }
    }

    #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
    fn subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.inner.subscriptions.lock().expect("subscription lock poisoned")
    }
}
