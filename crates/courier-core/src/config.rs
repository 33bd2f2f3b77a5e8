//! Tunables for the session core.

use std::time::Duration;

/// Default replenishment threshold.
pub const DEFAULT_PRE_KEY_THRESHOLD: usize = 20;

/// Default replenishment batch size.
pub const DEFAULT_PRE_KEY_BATCH: u32 = 50;

/// Default number of one-time pre-keys generated at registration.
pub const DEFAULT_INITIAL_PRE_KEYS: u32 = 100;

/// Default window in which a second outgoing reset for a peer is skipped.
pub const DEFAULT_RESET_COOLDOWN: Duration = Duration::from_secs(30);

/// Default window in which a repeated incoming reset is ignored.
pub const DEFAULT_RESET_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Default lifetime of a tried-envelope id.
pub const DEFAULT_TRIED_ENVELOPE_TTL: Duration = Duration::from_secs(60);

/// Session layer configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Refuse to establish against a bundle without a one-time pre-key.
    ///
    /// Off by default: such establishments proceed on the signed pre-key
    /// alone, and the first message loses some forward secrecy.
    pub require_one_time_pre_key: bool,
}

/// Pre-key supply configuration.
#[derive(Debug, Clone)]
pub struct PreKeyConfig {
    /// Replenish when fewer than this many one-time pre-keys remain
    pub threshold: usize,
    /// One-time pre-keys generated per replenishment
    pub batch_size: u32,
    /// One-time pre-keys generated at registration
    pub initial_batch_size: u32,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_PRE_KEY_THRESHOLD,
            batch_size: DEFAULT_PRE_KEY_BATCH,
            initial_batch_size: DEFAULT_INITIAL_PRE_KEYS,
        }
    }
}

/// Session recovery configuration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Minimum time between two outgoing resets for the same peer
    pub cooldown: Duration,
    /// Window in which a repeated incoming reset is a duplicate
    pub dedup_window: Duration,
    /// How long an envelope id stays marked as tried
    pub tried_envelope_ttl: Duration,
    /// Name sent to peers in reset notices
    pub display_name: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_RESET_COOLDOWN,
            dedup_window: DEFAULT_RESET_DEDUP_WINDOW,
            tried_envelope_ttl: DEFAULT_TRIED_ENVELOPE_TTL,
            display_name: String::new(),
        }
    }
}
