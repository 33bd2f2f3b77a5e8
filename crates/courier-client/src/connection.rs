//! Relay link state machine.
//!
//! Tracks connection status, reconnect backoff, heartbeats and request ids.
//! Uses the action pattern: methods take inputs (time, frames, credential
//! availability) and return [`TransportAction`]s for the driver to execute.
//! No I/O happens here, so every transition is testable without a socket.
//!
//! # State Machine
//!
//! ```text
//!                connect()            opened
//! ┌──────────────┐ ──────> ┌────────────┐ ─────> ┌───────────┐
//! │ Disconnected │         │ Connecting │        │ Connected │
//! └──────────────┘ <────── └────────────┘        └───────────┘
//!        ^   disconnect()     ^     │ open failed      │ closed
//!        │                    │     ↓                  ↓
//!        │              due   │  ┌──────────────────────────┐
//!        │                    └──│ Reconnecting { attempt } │
//!        │                       └──────────────────────────┘
//!        │  connect()                     │ attempts exhausted
//!        │                                ↓
//!        │                           ┌────────┐
//!        └───────────────────────────│ Failed │
//!                                    └────────┘
//! ```

use std::{ops::Sub, time::Duration};

use courier_proto::{
    ErrorPayload, Frame, FrameHeader, Opcode, Payload,
    payloads::{
        relay::{Ack, Data},
        session::{Hello, PROTOCOL_VERSION},
    },
};

use crate::{config::TransportConfig, credentials::Credential, error::TransportError, events::TransportEvent};

/// Link status, as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// No link, not trying to get one
    Disconnected,
    /// Opening a link
    Connecting,
    /// Link open, Hello sent
    Connected,
    /// Waiting before reconnect attempt `attempt`
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Reconnect attempts exhausted. Only an explicit connect resumes.
    Failed,
}

/// Actions returned by the transport state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAction {
    /// Open a link to the relay and report back via `handle_opened` or
    /// `handle_open_failed`
    Open,
    /// Send this frame on the open link
    SendFrame(Frame),
    /// Close the link
    Close {
        /// Reason for closing
        reason: String,
    },
    /// Call `handle_reconnect_due(attempt)` after `delay`
    ScheduleReconnect {
        /// Attempt the timer belongs to
        attempt: u32,
        /// Backoff delay
        delay: Duration,
    },
    /// Cancel a pending reconnect timer
    CancelReconnect,
    /// Call `tick` every `interval`
    StartHeartbeat {
        /// Keepalive interval
        interval: Duration,
    },
    /// Stop calling `tick`
    StopHeartbeat,
    /// Publish an event to subscribers
    Emit(TransportEvent),
    /// Complete the request waiting on `request_id`
    Resolve {
        /// Correlation id from the response header
        request_id: u32,
        /// Response payload, or the relay's rejection
        result: Result<Payload, TransportError>,
    },
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
///
/// Saturates instead of overflowing for absurd attempt numbers.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent)
}

/// Relay link state machine.
///
/// Generic over `I` (instant type) so simulations can drive it with virtual
/// time.
#[derive(Debug, Clone)]
pub struct TransportMachine<I> {
    config: TransportConfig,
    status: TransportStatus,
    /// Reconnect attempts since the last successful open
    attempts: u32,
    last_keepalive: Option<I>,
    next_request_id: u32,
    session_id: Option<u64>,
}

impl<I> TransportMachine<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// New machine in [`TransportStatus::Disconnected`].
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            status: TransportStatus::Disconnected,
            attempts: 0,
            last_keepalive: None,
            next_request_id: 0,
            session_id: None,
        }
    }

    /// Current status.
    pub fn status(&self) -> TransportStatus {
        self.status
    }

    /// True while the link is open.
    pub fn is_connected(&self) -> bool {
        self.status == TransportStatus::Connected
    }

    /// Reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    /// Relay session id from the last `HelloReply`.
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Start an explicit connect.
    ///
    /// Resumes from every state except an open or opening link, including
    /// [`TransportStatus::Failed`].
    ///
    /// # Errors
    ///
    /// - `NotAuthenticated` without a credential
    /// - `Connection` if a link is already open or being opened
    pub fn begin_connect(
        &mut self,
        credential: Option<&Credential>,
    ) -> Result<Vec<TransportAction>, TransportError> {
        if credential.is_none() {
            return Err(TransportError::NotAuthenticated);
        }

        let mut actions = Vec::new();
        match self.status {
            TransportStatus::Connected | TransportStatus::Connecting => {
                return Err(TransportError::Connection("already connected or connecting".into()));
            },
            TransportStatus::Reconnecting { .. } => actions.push(TransportAction::CancelReconnect),
            TransportStatus::Disconnected | TransportStatus::Failed => {},
        }

        self.attempts = 0;
        self.set_status(TransportStatus::Connecting, &mut actions);
        actions.push(TransportAction::Open);
        Ok(actions)
    }

    /// The link requested by [`TransportAction::Open`] is open.
    ///
    /// # Errors
    ///
    /// - `Closed` if the machine stopped waiting for it (disconnected in the
    ///   meantime). The driver must drop the link.
    pub fn handle_opened(
        &mut self,
        credential: &Credential,
        now: I,
    ) -> Result<Vec<TransportAction>, TransportError> {
        if self.status != TransportStatus::Connecting {
            return Err(TransportError::Closed);
        }

        let hello = Payload::Hello(Hello {
            version: PROTOCOL_VERSION,
            user_id: credential.user_id.clone(),
            auth_token: credential.token.clone(),
        })
        .to_frame()?;

        self.attempts = 0;
        self.last_keepalive = Some(now);

        let mut actions = vec![
            TransportAction::SendFrame(hello),
            TransportAction::StartHeartbeat { interval: self.config.heartbeat_interval },
        ];
        self.set_status(TransportStatus::Connected, &mut actions);
        actions.push(TransportAction::Emit(TransportEvent::Connected));

        tracing::info!(relay = %self.config.relay_address, "connected to relay");
        Ok(actions)
    }

    /// The link requested by [`TransportAction::Open`] could not be opened.
    pub fn handle_open_failed(&mut self, reason: &str, has_credential: bool) -> Vec<TransportAction> {
        if self.status != TransportStatus::Connecting {
            return Vec::new();
        }

        tracing::warn!(relay = %self.config.relay_address, reason, "failed to open relay link");
        let mut actions = vec![TransportAction::Emit(TransportEvent::Error(format!(
            "connection failed: {reason}"
        )))];
        actions.extend(self.attempt_reconnect(has_credential));
        actions
    }

    /// The open link closed (remote close, network failure).
    pub fn handle_closed(&mut self, code: Option<u32>, has_credential: bool) -> Vec<TransportAction> {
        if self.status != TransportStatus::Connected {
            return Vec::new();
        }

        tracing::info!(?code, "relay link closed");
        self.last_keepalive = None;
        self.session_id = None;

        let mut actions = vec![
            TransportAction::StopHeartbeat,
            TransportAction::Emit(TransportEvent::Disconnected { code }),
        ];
        self.set_status(TransportStatus::Disconnected, &mut actions);
        actions.extend(self.attempt_reconnect(has_credential));
        actions
    }

    /// Schedule the next reconnect attempt, or give up.
    ///
    /// Attempt `n` waits [`backoff_delay`]`(base, n)`. Once
    /// `max_reconnect_attempts` attempts have been scheduled the machine
    /// enters [`TransportStatus::Failed`] and schedules nothing further.
    pub fn attempt_reconnect(&mut self, has_credential: bool) -> Vec<TransportAction> {
        let mut actions = Vec::new();
        if self.status == TransportStatus::Connected {
            return actions;
        }

        if !has_credential {
            tracing::warn!("not reconnecting: no credential");
            self.set_status(TransportStatus::Disconnected, &mut actions);
            actions.push(TransportAction::Emit(TransportEvent::Error(
                TransportError::NotAuthenticated.to_string(),
            )));
            return actions;
        }

        if self.attempts >= self.config.max_reconnect_attempts {
            tracing::error!(attempts = self.attempts, "giving up on relay connection");
            self.set_status(TransportStatus::Failed, &mut actions);
            actions.push(TransportAction::Emit(TransportEvent::Error(format!(
                "connection failed after {} reconnect attempts",
                self.attempts
            ))));
            return actions;
        }

        self.attempts += 1;
        let attempt = self.attempts;
        let delay = backoff_delay(self.config.reconnect_base_delay, attempt);
        tracing::info!(attempt, ?delay, "scheduling reconnect");

        self.set_status(TransportStatus::Reconnecting { attempt }, &mut actions);
        actions.push(TransportAction::ScheduleReconnect { attempt, delay });
        actions
    }

    /// The timer for `attempt` fired.
    ///
    /// Stale timers (cancelled by connect or disconnect) are ignored.
    pub fn handle_reconnect_due(&mut self, attempt: u32, has_credential: bool) -> Vec<TransportAction> {
        let mut actions = Vec::new();
        if self.status != (TransportStatus::Reconnecting { attempt }) {
            return actions;
        }

        if !has_credential {
            tracing::warn!(attempt, "reconnect cancelled: no credential");
            self.set_status(TransportStatus::Disconnected, &mut actions);
            actions.push(TransportAction::Emit(TransportEvent::Error(
                TransportError::NotAuthenticated.to_string(),
            )));
            return actions;
        }

        self.set_status(TransportStatus::Connecting, &mut actions);
        actions.push(TransportAction::Open);
        actions
    }

    /// Process a frame received on the open link.
    ///
    /// Every decodable envelope is emitted and acknowledged, whatever
    /// happens to it downstream.
    pub fn handle_frame(&mut self, frame: &Frame) -> Vec<TransportAction> {
        let mut actions = Vec::new();
        if self.status != TransportStatus::Connected {
            return actions;
        }

        let payload = match Payload::from_frame(frame) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(opcode = frame.header.opcode(), error = %e, "undecodable frame from relay");
                actions.push(TransportAction::Emit(TransportEvent::Error(format!(
                    "undecodable frame: {e}"
                ))));
                return actions;
            },
        };
        let request_id = frame.header.request_id();

        match payload {
            Payload::Envelope(envelope) => {
                tracing::debug!(id = %envelope.id, from = %envelope.source_id, "envelope received");
                let ack = self.ack_frame(&envelope.id);
                actions.push(TransportAction::Emit(TransportEvent::Envelope(envelope)));
                match ack {
                    Ok(frame) => actions.push(TransportAction::SendFrame(frame)),
                    Err(e) => tracing::warn!(error = %e, "failed to encode ack"),
                }
            },
            Payload::Ack(ack) => {
                actions.push(TransportAction::Emit(TransportEvent::Ack { message_id: ack.id }));
            },
            Payload::Ping => actions.push(TransportAction::SendFrame(Frame::empty(Opcode::Pong))),
            Payload::Pong => {},
            Payload::HelloReply(reply) => {
                tracing::debug!(session_id = reply.session_id, "relay accepted hello");
                self.session_id = Some(reply.session_id);
            },
            Payload::Goodbye(goodbye) => {
                tracing::info!(reason = %goodbye.reason, "relay said goodbye");
            },
            Payload::Error(error) if request_id != 0 => {
                actions.push(TransportAction::Resolve {
                    request_id,
                    result: Err(TransportError::Rejected { code: error.code, message: error.message }),
                });
            },
            Payload::Error(error) => self.handle_relay_error(error, &mut actions),
            response @ (Payload::KeyBundle(_) | Payload::KeyBundlePublished(_)) if request_id != 0 => {
                actions.push(TransportAction::Resolve { request_id, result: Ok(response) });
            },
            other => {
                tracing::warn!(opcode = ?other.opcode(), "unexpected frame from relay");
            },
        }

        actions
    }

    /// Periodic maintenance: sends an empty keepalive once per heartbeat
    /// interval while connected.
    pub fn tick(&mut self, now: I) -> Vec<TransportAction> {
        if self.status != TransportStatus::Connected {
            return Vec::new();
        }

        let due = self
            .last_keepalive
            .is_none_or(|last| now - last >= self.config.heartbeat_interval);
        if !due {
            return Vec::new();
        }

        self.last_keepalive = Some(now);
        vec![TransportAction::SendFrame(Frame::empty(Opcode::Ping))]
    }

    /// Acknowledge `envelope_id` to the relay.
    ///
    /// Best effort: without an open link the ack is dropped with a warning,
    /// and the relay redelivers the envelope on the next connection.
    pub fn acknowledge(&mut self, envelope_id: &str) -> Vec<TransportAction> {
        if self.status != TransportStatus::Connected {
            tracing::warn!(envelope_id, "ack dropped, not connected");
            return Vec::new();
        }

        match self.ack_frame(envelope_id) {
            Ok(frame) => vec![TransportAction::SendFrame(frame)],
            Err(e) => {
                tracing::warn!(envelope_id, error = %e, "failed to encode ack");
                Vec::new()
            },
        }
    }

    /// Frame for an outbound data message.
    ///
    /// # Errors
    ///
    /// - `NotConnected` without an open link
    pub fn data_frame(&self, data: Data) -> Result<Frame, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(Payload::Data(data).to_frame()?)
    }

    /// Frame for a relay request, with a fresh nonzero correlation id.
    ///
    /// # Errors
    ///
    /// - `NotConnected` without an open link
    pub fn request_frame(&mut self, payload: Payload) -> Result<(u32, Frame), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        let request_id = self.next_request_id;
        let opcode = payload.opcode();
        let frame = payload.into_frame(FrameHeader::with_request_id(opcode, request_id))?;
        Ok((request_id, frame))
    }

    /// Explicit disconnect. Safe in every state; a second call does nothing.
    pub fn disconnect(&mut self, reason: &str) -> Vec<TransportAction> {
        let mut actions = Vec::new();
        let previous = self.status;

        match previous {
            TransportStatus::Disconnected => return actions,
            TransportStatus::Connected => {
                actions.push(TransportAction::StopHeartbeat);
                actions.push(TransportAction::Close { reason: reason.to_string() });
            },
            TransportStatus::Connecting => {
                actions.push(TransportAction::Close { reason: reason.to_string() });
            },
            TransportStatus::Reconnecting { .. } => actions.push(TransportAction::CancelReconnect),
            TransportStatus::Failed => {},
        }

        self.attempts = 0;
        self.last_keepalive = None;
        self.session_id = None;
        self.set_status(TransportStatus::Disconnected, &mut actions);
        if previous == TransportStatus::Connected {
            actions.push(TransportAction::Emit(TransportEvent::Disconnected { code: None }));
        }

        tracing::info!(reason, "disconnected from relay");
        actions
    }

    fn handle_relay_error(&mut self, error: ErrorPayload, actions: &mut Vec<TransportAction>) {
        tracing::warn!(code = error.code, message = %error.message, "relay error");

        if error.code == ErrorPayload::AUTH_FAILED {
            // Retrying with the same credential cannot succeed
            actions.push(TransportAction::StopHeartbeat);
            actions.push(TransportAction::Close { reason: "authentication failed".into() });
            self.last_keepalive = None;
            self.set_status(TransportStatus::Failed, actions);
        }
        actions.push(TransportAction::Emit(TransportEvent::Error(error.message)));
    }

    fn ack_frame(&self, envelope_id: &str) -> Result<Frame, TransportError> {
        Ok(Payload::Ack(Ack { id: envelope_id.to_string() }).to_frame()?)
    }

    fn set_status(&mut self, status: TransportStatus, actions: &mut Vec<TransportAction>) {
        if self.status == status {
            return;
        }
        tracing::debug!(from = ?self.status, to = ?status, "transport status");
        self.status = status;
        actions.push(TransportAction::Emit(TransportEvent::Status(status)));
    }
}
