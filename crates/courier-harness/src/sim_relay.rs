//! Simulation relay for testing with turmoil.
//!
//! `SimRelay` drives a [`RelayState`] over turmoil TCP. Each accepted
//! connection gets a reader task feeding frames into the relay core and a
//! writer task draining that connection's outbound queue. Actions are
//! executed under the state lock, and none of them await.
//!
//! Handles are cheap to clone: the host closure and the test body share one
//! relay, so the test can inspect mailboxes or kick users mid-scenario.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use courier_proto::Frame;
use tokio::{io::AsyncWriteExt, sync::mpsc, task::AbortHandle};
use turmoil::net::TcpListener;

use crate::{
    relay::{ConnectionId, RelayAction, RelayState, RelaySnapshot},
    wire,
};

/// Port the simulated relay listens on.
pub const RELAY_PORT: u16 = 4433;

/// Host name of the relay in [`simulation`].
pub const RELAY_HOST: &str = "relay";

/// Simulated time budget of every scenario. Long enough for a full reconnect
/// backoff schedule.
pub const SIMULATION_DURATION: Duration = Duration::from_secs(300);

/// Simulation with `relay` serving on [`RELAY_HOST`].
pub fn simulation(relay: &SimRelay) -> turmoil::Sim<'static> {
    let mut sim = turmoil::Builder::new().simulation_duration(SIMULATION_DURATION).build();
    let relay = relay.clone();
    sim.host(RELAY_HOST, move || {
        let relay = relay.clone();
        async move { relay.serve().await }
    });
    sim
}

struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<Frame>,
    reader: AbortHandle,
}

#[derive(Default)]
struct Shared {
    state: RelayState,
    next_connection: ConnectionId,
    connections: HashMap<ConnectionId, ConnectionHandle>,
}

/// Shared handle to a simulated relay.
#[derive(Clone, Default)]
pub struct SimRelay {
    shared: Arc<Mutex<Shared>>,
}

impl SimRelay {
    /// Relay with an empty registry and no mailboxes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept connections on [`RELAY_PORT`] until the simulation ends.
    ///
    /// Use as the body of a turmoil host.
    pub async fn serve(&self) -> turmoil::Result {
        let address = format!("0.0.0.0:{RELAY_PORT}");
        let listener = TcpListener::bind(address.as_str()).await?;
        tracing::debug!(port = RELAY_PORT, "sim relay listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let (mut reader, mut writer) = tokio::io::split(stream);
            let (outbound, mut queue) = mpsc::unbounded_channel::<Frame>();

            tokio::spawn(async move {
                while let Some(frame) = queue.recv().await {
                    if let Err(e) = wire::write_frame(&mut writer, &frame).await {
                        tracing::debug!(error = %e, "relay write failed");
                        break;
                    }
                }
                let _ = writer.shutdown().await;
            });

            // Hold the lock across spawn so the reader can't run before the
            // connection is registered
            let mut shared = self.lock();
            shared.next_connection += 1;
            let connection = shared.next_connection;

            let relay = self.clone();
            let reader_task = tokio::spawn(async move {
                loop {
                    match wire::read_frame(&mut reader).await {
                        Ok(Some(frame)) => relay.dispatch(connection, &frame),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(connection, error = %e, "relay read failed");
                            break;
                        },
                    }
                }
                relay.forget(connection);
            });

            shared.state.connection_opened(connection);
            shared
                .connections
                .insert(connection, ConnectionHandle { outbound, reader: reader_task.abort_handle() });
            tracing::debug!(connection, %peer, "relay accepted connection");
        }
    }

    /// Only accept `token` for `user`.
    pub fn require_token(&self, user: &str, token: &str) {
        self.lock().state.require_token(user, token);
    }

    /// Drop `user`'s connection as a network failure would.
    pub fn kick(&self, user: &str) {
        let mut shared = self.lock();
        let actions = shared.state.kick(user);
        Self::execute(&mut shared, actions);
    }

    /// Whether `user` has an authenticated connection.
    pub fn is_online(&self, user: &str) -> bool {
        self.lock().state.is_online(user)
    }

    /// Unacknowledged envelopes for `user`.
    pub fn pending(&self, user: &str) -> usize {
        self.lock().state.pending(user)
    }

    /// One-time pre-keys still held for `user`.
    pub fn available_pre_keys(&self, user: &str) -> usize {
        self.lock().state.available_pre_keys(user)
    }

    /// Ledger snapshot for invariant checks.
    pub fn snapshot(&self) -> RelaySnapshot {
        self.lock().state.snapshot()
    }

    fn dispatch(&self, connection: ConnectionId, frame: &Frame) {
        let mut shared = self.lock();
        let actions = shared.state.handle_frame(connection, frame);
        Self::execute(&mut shared, actions);
    }

    fn forget(&self, connection: ConnectionId) {
        let mut shared = self.lock();
        shared.connections.remove(&connection);
        shared.state.connection_closed(connection);
    }

    fn execute(shared: &mut Shared, actions: Vec<RelayAction>) {
        for action in actions {
            match action {
                RelayAction::Send { connection, frame } => {
                    let delivered = shared
                        .connections
                        .get(&connection)
                        .is_some_and(|handle| handle.outbound.send(frame).is_ok());
                    if !delivered {
                        tracing::debug!(connection, "frame for closed connection dropped");
                    }
                },
                RelayAction::Close { connection, reason } => {
                    // Dropping the queue lets the writer flush and shut down
                    if let Some(handle) = shared.connections.remove(&connection) {
                        handle.reader.abort();
                    }
                    shared.state.connection_closed(connection);
                    tracing::debug!(connection, %reason, "relay closed connection");
                },
            }
        }
    }

    #[allow(clippy::expect_used, reason = "a poisoned relay means a test already panicked")]
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("sim relay lock poisoned")
    }
}
