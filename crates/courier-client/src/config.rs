//! Client configuration.

use std::time::Duration;

use courier_core::{PreKeyConfig, RecoveryConfig, SessionConfig};

/// Interval between empty keepalive frames while connected.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Reconnect attempts before the transport gives up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Delay before the first reconnect attempt. Doubles on every attempt.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Frames buffered between the transport and the link task.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// How long a relay request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay address handed to the connector
    pub relay_address: String,
    /// Keepalive interval
    pub heartbeat_interval: Duration,
    /// Reconnect attempts before entering the failed state
    pub max_reconnect_attempts: u32,
    /// First reconnect delay
    pub reconnect_base_delay: Duration,
    /// Outbound frame buffer per link.
    ///
    /// Frames that don't fit are dropped with a warning, automatic acks
    /// included. A shed ack leaves the envelope pending at the relay, which
    /// delivers it again after the next reconnect.
    pub outbound_buffer: usize,
    /// Relay request timeout
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relay_address: "127.0.0.1:4433".to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Everything a [`Messenger`](crate::Messenger) needs to be configured with.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Relay link
    pub transport: TransportConfig,
    /// Session establishment policy
    pub session: SessionConfig,
    /// Pre-key supply
    pub pre_keys: PreKeyConfig,
    /// Session recovery
    pub recovery: RecoveryConfig,
}
