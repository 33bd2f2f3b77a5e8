//! Minimal deterministic environment for unit tests in this crate.
//!
//! Scenario tests use the full simulation environment from the harness
//! crate instead.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::env::Environment;

/// Manual clock plus a splitmix64 byte stream.
#[derive(Clone)]
pub(crate) struct TestEnv {
    clock_ms: Arc<AtomicU64>,
    rng: Arc<AtomicU64>,
}

impl TestEnv {
    pub(crate) fn new(seed: u64) -> Self {
        Self { clock_ms: Arc::new(AtomicU64::new(0)), rng: Arc::new(AtomicU64::new(seed)) }
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.clock_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    fn next_u64(&self) -> u64 {
        let mut z = self.rng.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::SeqCst)
            .wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl Environment for TestEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::from_millis(self.clock_ms.load(Ordering::SeqCst))
    }

    fn wall_clock_millis(&self) -> u64 {
        1_700_000_000_000 + self.clock_ms.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(8) {
            let word = self.next_u64().to_be_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}
