//! Simulated environment.
//!
//! Time comes from tokio's clock, which turmoil drives; randomness from a
//! seeded ChaCha20 stream. The same seed and the same simulation produce the
//! same keys, message ids and request ids.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use courier_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Wall-clock time at the start of every simulation (2023-11-14).
pub const SIM_EPOCH_MILLIS: u64 = 1_700_000_000_000;

/// Deterministic [`Environment`] for simulation.
#[derive(Clone)]
pub struct SimEnv {
    origin: tokio::time::Instant,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SimEnv {
    /// Environment seeded with `seed`.
    ///
    /// Must be created inside a runtime: the wall clock starts at
    /// [`SIM_EPOCH_MILLIS`] at the moment of creation.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
        }
    }

    /// Simulated time since creation.
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn wall_clock_millis(&self) -> u64 {
        SIM_EPOCH_MILLIS + self.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used, reason = "a poisoned RNG means a test already panicked")]
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("sim rng poisoned").fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn same_seed_same_stream() {
        let a = SimEnv::with_seed(7);
        let b = SimEnv::with_seed(7);
        let c = SimEnv::with_seed(8);

        assert_eq!(a.random_array::<32>(), b.random_array::<32>());
        assert_ne!(a.random_u64(), c.random_u64());
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_follows_simulated_time() {
        let env = SimEnv::with_seed(1);
        assert_eq!(env.wall_clock_millis(), SIM_EPOCH_MILLIS);

        env.sleep(Duration::from_secs(3)).await;
        assert_eq!(env.wall_clock_millis(), SIM_EPOCH_MILLIS + 3_000);
    }
}
