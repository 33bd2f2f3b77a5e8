//! Test peers.
//!
//! A [`TestPeer`] is one device: a full [`Messenger`] over in-memory stores,
//! the real ratchet engine, a seeded [`SimEnv`] and a [`SimConnector`]. It
//! must be created inside a turmoil host or client.

use std::{sync::Arc, time::Duration};

use courier_client::{
    ClientConfig, InboundEvent, InboundMessage, Messenger, MessengerError, StaticCredentials, TransportConfig,
    TransportError,
};
use courier_core::{
    ContactBook, Keyring, MemoryContactBook, MemoryKeyStore, RecoveryConfig, StoreError,
    session::session_address,
};
use courier_crypto::RatchetEngine;
use tokio::sync::mpsc;

use crate::{SimConnector, SimEnv, sim_relay::RELAY_PORT};

/// How long [`TestPeer::next_message`] waits.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Messenger type every test peer runs.
pub type SimMessenger = Messenger<MemoryKeyStore, RatchetEngine, SimEnv, SimConnector>;

/// One simulated device.
pub struct TestPeer {
    name: String,
    messenger: SimMessenger,
    inbox: mpsc::UnboundedReceiver<InboundEvent>,
    store: MemoryKeyStore,
    contacts: Arc<MemoryContactBook>,
    connector: SimConnector,
    env: SimEnv,
}

impl TestPeer {
    /// Default client configuration for a peer talking to `relay_host`.
    pub fn config(name: &str, relay_host: &str) -> ClientConfig {
        ClientConfig {
            transport: TransportConfig {
                relay_address: format!("{relay_host}:{RELAY_PORT}"),
                ..TransportConfig::default()
            },
            recovery: RecoveryConfig { display_name: name.to_string(), ..RecoveryConfig::default() },
            ..ClientConfig::default()
        }
    }

    /// Offline peer with its inbound pipeline started.
    pub fn new(name: &str, relay_host: &str, seed: u64) -> Self {
        Self::with_config(name, seed, Self::config(name, relay_host))
    }

    /// Offline peer with a custom configuration.
    pub fn with_config(name: &str, seed: u64, config: ClientConfig) -> Self {
        let store = MemoryKeyStore::new();
        let contacts = Arc::new(MemoryContactBook::new());
        let connector = SimConnector::new();
        let env = SimEnv::with_seed(seed);
        let book: Arc<dyn ContactBook> = contacts.clone();

        let messenger = Messenger::new(
            config,
            store.clone(),
            RatchetEngine,
            env.clone(),
            connector.clone(),
            Arc::new(StaticCredentials::new(name, format!("token-{name}"))),
            book,
        );
        let inbox = messenger.start();

        Self { name: name.to_string(), messenger, inbox, store, contacts, connector, env }
    }

    /// Connected and registered peer.
    pub async fn online(name: &str, relay_host: &str, seed: u64) -> Result<Self, MessengerError> {
        let peer = Self::new(name, relay_host, seed);
        peer.connect().await?;
        peer.messenger.register().await?;
        Ok(peer)
    }

    /// Connect, letting the reconnect loop retry if the relay isn't
    /// listening yet.
    pub async fn connect(&self) -> Result<(), MessengerError> {
        if let Err(e) = self.messenger.connect().await {
            tracing::debug!(peer = %self.name, error = %e, "first connect failed, waiting for retry");
        }
        self.wait_connected().await
    }

    /// Wait up to [`RECEIVE_TIMEOUT`] for the transport to be connected.
    pub async fn wait_connected(&self) -> Result<(), MessengerError> {
        let connected = async {
            while !self.messenger.is_connected() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(RECEIVE_TIMEOUT, connected)
            .await
            .map_err(|_| MessengerError::Transport(TransportError::Timeout))
    }

    /// Account id.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The peer's messenger.
    pub fn messenger(&self) -> &SimMessenger {
        &self.messenger
    }

    /// Backing key store.
    pub fn store(&self) -> &MemoryKeyStore {
        &self.store
    }

    /// Contact book.
    pub fn contacts(&self) -> &MemoryContactBook {
        &self.contacts
    }

    /// Connector, for failure injection.
    pub fn connector(&self) -> &SimConnector {
        &self.connector
    }

    /// Environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Encrypt and send `text` to `peer`.
    pub async fn send_text(&self, peer: &str, text: &str) -> Result<String, MessengerError> {
        self.messenger.send(peer, text.as_bytes()).await
    }

    /// Next pipeline event, or `None` after [`RECEIVE_TIMEOUT`].
    pub async fn next_event(&mut self) -> Option<InboundEvent> {
        tokio::time::timeout(RECEIVE_TIMEOUT, self.inbox.recv()).await.ok().flatten()
    }

    /// Next decrypted message, or `None` after [`RECEIVE_TIMEOUT`] or if the
    /// next event is something else.
    pub async fn next_message(&mut self) -> Option<InboundMessage> {
        match self.next_event().await? {
            InboundEvent::Message(message) => Some(message),
            other => {
                tracing::debug!(peer = %self.name, event = ?other, "expected a message");
                None
            },
        }
    }

    /// Next message as `(sender, text)`.
    pub async fn next_text(&mut self) -> Option<(String, String)> {
        let message = self.next_message().await?;
        Some((message.sender, String::from_utf8_lossy(&message.body).into_owned()))
    }

    /// Lose the local session with `peer`, as a restore from an old backup
    /// would. Trust is kept.
    pub fn forget_session(&self, peer: &str) -> Result<bool, StoreError> {
        Keyring::new(self.store.clone()).remove_session(&session_address(peer))
    }
}
