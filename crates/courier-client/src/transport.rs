//! Async driver for the relay link.
//!
//! [`Transport`] owns a [`TransportMachine`] and executes its actions with
//! tokio: it opens links through a [`Connector`], forwards frames, runs the
//! heartbeat and reconnect timers, correlates relay responses, and publishes
//! [`TransportEvent`]s. The [`Connector`] is the only thing that knows about
//! sockets, so simulations plug in an in-memory relay.
//!
//! The state lock is a `std` mutex and is never held across an await.
//! Subscriber handlers run after the lock is released.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use courier_core::{Ciphertext, DeliveryError, Environment, MessageSink};
use courier_proto::{Frame, Payload, payloads::relay::Data};
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
};

use crate::{
    config::TransportConfig,
    connection::{TransportAction, TransportMachine, TransportStatus},
    credentials::CredentialProvider,
    error::TransportError,
    events::{EventBus, EventKind, Subscription, TransportEvent},
};

/// Something the link reports to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Frame received from the relay
    Frame(Frame),
    /// The link closed
    Closed {
        /// Close code, if the link reported one
        code: Option<u32>,
    },
}

/// An open duplex frame channel to the relay.
///
/// Frames sent on `to_relay` go out; frames and the final close arrive on
/// `from_relay`. The optional abort handle stops the task doing the I/O.
pub struct Link {
    to_relay: mpsc::Sender<Frame>,
    from_relay: mpsc::Receiver<LinkEvent>,
    abort: Option<AbortHandle>,
}

impl Link {
    /// Link over the given channels.
    pub fn new(to_relay: mpsc::Sender<Frame>, from_relay: mpsc::Receiver<LinkEvent>) -> Self {
        Self { to_relay, from_relay, abort: None }
    }

    /// Abort `handle` when the link is closed.
    #[must_use]
    pub fn with_abort(mut self, handle: AbortHandle) -> Self {
        self.abort = Some(handle);
        self
    }

    /// Stop the I/O task, if any.
    pub fn close(self) {
        if let Some(handle) = self.abort {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("open", &!self.to_relay.is_closed()).finish()
    }
}

/// Opens links to the relay.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a link to `relay_address`. Resolves once the link is open.
    async fn connect(&self, relay_address: &str) -> Result<Link, TransportError>;
}

struct ActiveLink {
    id: u64,
    to_relay: mpsc::Sender<Frame>,
    reader: AbortHandle,
    io: Option<AbortHandle>,
}

impl ActiveLink {
    fn close(self) {
        self.reader.abort();
        if let Some(io) = self.io {
            io.abort();
        }
    }
}

type PendingRequest = oneshot::Sender<Result<Payload, TransportError>>;

struct DriverState<I> {
    machine: TransportMachine<I>,
    link: Option<ActiveLink>,
    next_link_id: u64,
    pending: HashMap<u32, PendingRequest>,
    heartbeat: Option<AbortHandle>,
    reconnect: Option<AbortHandle>,
}

struct Shared<C, E: Environment> {
    connector: C,
    credentials: Arc<dyn CredentialProvider>,
    env: E,
    config: TransportConfig,
    events: EventBus,
    state: Mutex<DriverState<E::Instant>>,
}

/// What the caller must do after the lock is released.
#[derive(Default)]
#[must_use]
struct Effects {
    events: Vec<TransportEvent>,
    open: bool,
}

/// Reconnecting, heartbeating relay link.
///
/// Cheap to clone; clones share the link.
pub struct Transport<C, E: Environment> {
    shared: Arc<Shared<C, E>>,
}

impl<C, E: Environment> Clone for Transport<C, E> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<C, E> Transport<C, E>
where
    C: Connector,
    E: Environment,
{
    /// Create a disconnected transport.
    pub fn new(
        connector: C,
        credentials: Arc<dyn CredentialProvider>,
        env: E,
        config: TransportConfig,
    ) -> Self {
        let state = DriverState {
            machine: TransportMachine::new(config.clone()),
            link: None,
            next_link_id: 0,
            pending: HashMap::new(),
            heartbeat: None,
            reconnect: None,
        };
        Self {
            shared: Arc::new(Shared {
                connector,
                credentials,
                env,
                config,
                events: EventBus::new(),
                state: Mutex::new(state),
            }),
        }
    }

    /// Connect to the relay. Resolves once the link is open.
    ///
    /// If opening fails the error is returned and the reconnect loop takes
    /// over in the background.
    ///
    /// # Errors
    ///
    /// - `NotAuthenticated` without a credential
    /// - `Connection` if the link could not be opened, or one is already open
    pub async fn connect(&self) -> Result<(), TransportError> {
        let credential = self.shared.credentials.credential();
        let effects = {
            let mut state = self.state();
            let actions = state.machine.begin_connect(credential.as_ref())?;
            self.apply(&mut state, actions)
        };
        self.finish(effects).await
    }

    /// Close the link and stop reconnecting. Safe to call in any state.
    pub fn disconnect(&self) {
        let effects = {
            let mut state = self.state();
            let actions = state.machine.disconnect("client disconnect");
            self.apply(&mut state, actions)
        };
        self.emit(effects.events);
    }

    /// True while the link is open.
    pub fn is_connected(&self) -> bool {
        self.state().machine.is_connected()
    }

    /// Current status.
    pub fn status(&self) -> TransportStatus {
        self.state().machine.status()
    }

    /// Reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.state().machine.reconnect_attempts()
    }

    /// Event surface.
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Subscribe to one kind of event.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(kind, handler)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.shared.events.unsubscribe(subscription)
    }

    /// Acknowledge an envelope. Best effort, see
    /// [`TransportMachine::acknowledge`].
    ///
    /// Envelopes are already acknowledged on receipt; this is for callers
    /// that receive envelope ids some other way.
    pub fn acknowledge(&self, envelope_id: &str) {
        let effects = {
            let mut state = self.state();
            let actions = state.machine.acknowledge(envelope_id);
            self.apply(&mut state, actions)
        };
        self.emit(effects.events);
    }

    /// Send a ciphertext to `recipient`. Returns the client message id the
    /// relay's ack event will carry.
    ///
    /// # Errors
    ///
    /// - `NotConnected` without an open link
    /// - `Closed` if the link closed while sending
    pub async fn send_data(
        &self,
        recipient: &str,
        ciphertext: Ciphertext,
    ) -> Result<String, TransportError> {
        let message_id = format!("{:016x}", self.shared.env.random_u64());
        let data = Data {
            message_id: message_id.clone(),
            recipient_id: recipient.to_string(),
            kind: ciphertext.kind,
            ciphertext: ciphertext.body,
            timestamp: self.shared.env.wall_clock_millis(),
        };

        let (frame, sender) = {
            let state = self.state();
            let frame = state.machine.data_frame(data)?;
            let sender = state.link.as_ref().map(|l| l.to_relay.clone()).ok_or(TransportError::NotConnected)?;
            (frame, sender)
        };

        sender.send(frame).await.map_err(|_| TransportError::Closed)?;
        tracing::debug!(%message_id, recipient, "data frame sent");
        Ok(message_id)
    }

    /// Send a request and wait for the correlated response.
    ///
    /// # Errors
    ///
    /// - `NotConnected` without an open link
    /// - `Rejected` if the relay answered with an error frame
    /// - `Timeout` after `request_timeout`
    /// - `Closed` if the link closed first
    pub async fn request(&self, payload: Payload) -> Result<Payload, TransportError> {
        let (request_id, frame, sender, response) = {
            let mut state = self.state();
            let (request_id, frame) = state.machine.request_frame(payload)?;
            let sender = state.link.as_ref().map(|l| l.to_relay.clone()).ok_or(TransportError::NotConnected)?;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(request_id, tx);
            (request_id, frame, sender, rx)
        };

        if sender.send(frame).await.is_err() {
            self.state().pending.remove(&request_id);
            return Err(TransportError::Closed);
        }

        tokio::select! {
            result = response => result.unwrap_or(Err(TransportError::Closed)),
            () = self.shared.env.sleep(self.shared.config.request_timeout) => {
                self.state().pending.remove(&request_id);
                tracing::warn!(request_id, "relay request timed out");
                Err(TransportError::Timeout)
            },
        }
    }

    async fn finish(&self, effects: Effects) -> Result<(), TransportError> {
        let open = effects.open;
        self.emit(effects.events);
        if open { self.open().await } else { Ok(()) }
    }

    async fn open(&self) -> Result<(), TransportError> {
        let result = self.shared.connector.connect(&self.shared.config.relay_address).await;
        let credential = self.shared.credentials.credential();

        let (effects, outcome) = {
            let mut state = self.state();
            match (result, credential) {
                (Ok(link), Some(credential)) => {
                    match state.machine.handle_opened(&credential, self.shared.env.now()) {
                        Ok(actions) => {
                            self.install_link(&mut state, link);
                            (self.apply(&mut state, actions), Ok(()))
                        },
                        Err(e) => {
                            link.close();
                            (Effects::default(), Err(e))
                        },
                    }
                },
                (Ok(link), None) => {
                    link.close();
                    let actions = state.machine.handle_open_failed("credential revoked", false);
                    (self.apply(&mut state, actions), Err(TransportError::NotAuthenticated))
                },
                (Err(e), credential) => {
                    let actions = state.machine.handle_open_failed(&e.to_string(), credential.is_some());
                    (self.apply(&mut state, actions), Err(e))
                },
            }
        };

        self.emit(effects.events);
        outcome
    }

    async fn reconnect_due(&self, attempt: u32) {
        let has_credential = self.shared.credentials.credential().is_some();
        let effects = {
            let mut state = self.state();
            let actions = state.machine.handle_reconnect_due(attempt, has_credential);
            self.apply(&mut state, actions)
        };
        if let Err(e) = self.finish(effects).await {
            tracing::debug!(attempt, error = %e, "reconnect attempt failed");
        }
    }

    fn heartbeat(&self) {
        let effects = {
            let mut state = self.state();
            let actions = state.machine.tick(self.shared.env.now());
            self.apply(&mut state, actions)
        };
        self.emit(effects.events);
    }

    fn on_link_event(&self, link_id: u64, event: LinkEvent) {
        let effects = {
            let mut state = self.state();
            if state.link.as_ref().is_none_or(|l| l.id != link_id) {
                return;
            }

            let actions = match event {
                LinkEvent::Frame(frame) => state.machine.handle_frame(&frame),
                LinkEvent::Closed { code } => {
                    Self::drop_link(&mut state);
                    let has_credential = self.shared.credentials.credential().is_some();
                    state.machine.handle_closed(code, has_credential)
                },
            };
            self.apply(&mut state, actions)
        };
        self.emit(effects.events);
    }

    fn install_link(&self, state: &mut DriverState<E::Instant>, link: Link) {
        Self::drop_link(state);

        state.next_link_id += 1;
        let id = state.next_link_id;
        let Link { to_relay, mut from_relay, abort } = link;

        let transport = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = from_relay.recv().await {
                let closed = matches!(event, LinkEvent::Closed { .. });
                transport.on_link_event(id, event);
                if closed {
                    return;
                }
            }
            transport.on_link_event(id, LinkEvent::Closed { code: None });
        });

        state.link = Some(ActiveLink { id, to_relay, reader: reader.abort_handle(), io: abort });
    }

    fn drop_link(state: &mut DriverState<E::Instant>) {
        if let Some(link) = state.link.take() {
            link.close();
        }
        // Waiting requests see their sender dropped and fail with `Closed`
        state.pending.clear();
    }

    fn apply(&self, state: &mut DriverState<E::Instant>, actions: Vec<TransportAction>) -> Effects {
        let mut effects = Effects::default();

        for action in actions {
            match action {
                TransportAction::Open => effects.open = true,
                TransportAction::SendFrame(frame) => match &state.link {
                    Some(link) => {
                        // Never block the driver; a full buffer sheds the frame
                        if let Err(e) = link.to_relay.try_send(frame) {
                            tracing::warn!(error = %e, "outbound frame dropped");
                        }
                    },
                    None => tracing::warn!("outbound frame dropped, no link"),
                },
                TransportAction::Close { reason } => {
                    tracing::debug!(%reason, "closing relay link");
                    Self::drop_link(state);
                },
                TransportAction::ScheduleReconnect { attempt, delay } => {
                    let transport = self.clone();
                    let handle = tokio::spawn(async move {
                        transport.shared.env.sleep(delay).await;
                        transport.reconnect_due(attempt).await;
                    });
                    if let Some(old) = state.reconnect.replace(handle.abort_handle()) {
                        old.abort();
                    }
                },
                TransportAction::CancelReconnect => {
                    if let Some(handle) = state.reconnect.take() {
                        handle.abort();
                    }
                },
                TransportAction::StartHeartbeat { interval } => {
                    let transport = self.clone();
                    let handle = tokio::spawn(async move {
                        loop {
                            transport.shared.env.sleep(interval).await;
                            transport.heartbeat();
                        }
                    });
                    if let Some(old) = state.heartbeat.replace(handle.abort_handle()) {
                        old.abort();
                    }
                },
                TransportAction::StopHeartbeat => {
                    if let Some(handle) = state.heartbeat.take() {
                        handle.abort();
                    }
                },
                TransportAction::Emit(event) => effects.events.push(event),
                TransportAction::Resolve { request_id, result } => {
                    match state.pending.remove(&request_id) {
                        Some(waiter) => {
                            // The caller may have timed out already
                            let _ = waiter.send(result);
                        },
                        None => tracing::debug!(request_id, "response for unknown request"),
                    }
                },
            }
        }

        effects
    }

    fn emit(&self, events: Vec<TransportEvent>) {
        for event in &events {
            self.shared.events.emit(event);
        }
    }

    #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
    fn state(&self) -> MutexGuard<'_, DriverState<E::Instant>> {
        self.shared.state.lock().expect("transport state lock poisoned")
    }
}

#[async_trait]
impl<C, E> MessageSink for Transport<C, E>
where
    C: Connector,
    E: Environment,
{
    async fn deliver(&self, peer: &str, ciphertext: Ciphertext) -> Result<String, DeliveryError> {
        Ok(self.send_data(peer, ciphertext).await?)
    }
}
