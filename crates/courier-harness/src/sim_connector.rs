//! Turmoil connector for the client transport.
//!
//! Opens simulated TCP links to a [`SimRelay`](crate::SimRelay). Tests can
//! refuse connections to exercise the reconnect loop, and count attempts to
//! check its backoff schedule.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use async_trait::async_trait;
use courier_client::{Connector, Link, LinkEvent, TransportError};
use courier_proto::Frame;
use tokio::{io::AsyncWriteExt, sync::mpsc, task::AbortHandle};
use turmoil::net::TcpStream;

use crate::wire;

const LINK_BUFFER: usize = 64;

/// [`Connector`] over turmoil TCP.
#[derive(Clone, Default)]
pub struct SimConnector {
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
}

impl SimConnector {
    /// Connector that connects normally.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every connect with a connection error while `refuse` is set.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connect calls so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, relay_address: &str) -> Result<Link, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("connection refused".to_string()));
        }

        let stream = TcpStream::connect(relay_address)
            .await
            .map_err(|e| TransportError::Connection(format!("connect failed: {e}")))?;

        let (to_relay_tx, to_relay_rx) = mpsc::channel::<Frame>(LINK_BUFFER);
        let (from_relay_tx, from_relay_rx) = mpsc::channel::<LinkEvent>(LINK_BUFFER);
        let handle = tokio::spawn(run_link(stream, to_relay_rx, from_relay_tx));

        Ok(Link::new(to_relay_tx, from_relay_rx).with_abort(handle.abort_handle()))
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Pump frames between the link channels and the stream until either side
/// ends. Aborting this task also stops its reader.
async fn run_link(
    stream: TcpStream,
    mut outbound: mpsc::Receiver<Frame>,
    events: mpsc::Sender<LinkEvent>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let reader_task = tokio::spawn(async move {
        loop {
            match wire::read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if events.send(LinkEvent::Frame(frame)).await.is_err() {
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "link read failed");
                    break;
                },
            }
        }
        let _ = events.send(LinkEvent::Closed { code: None }).await;
    });
    let _reader = AbortOnDrop(reader_task.abort_handle());

    while let Some(frame) = outbound.recv().await {
        if let Err(e) = wire::write_frame(&mut writer, &frame).await {
            tracing::debug!(error = %e, "link write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
