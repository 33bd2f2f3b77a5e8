//! Production environment: system clock, tokio timers, OS entropy.

use std::time::Duration;

use courier_core::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// # Panics
///
/// `random_bytes` panics if the OS RNG fails. Key material, nonces and
/// registration ids all come from it; there is no safe way to continue.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a system environment.
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[allow(clippy::expect_used, reason = "a clock before 1970 is a broken host")]
    fn wall_clock_millis(&self) -> u64 {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after the Unix epoch");
        since_epoch.as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used, reason = "OS RNG failure is unrecoverable")]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG is available");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_advances() {
        let env = SystemEnv::new();
        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(env.now() > t1);
    }

    #[test]
    fn random_bytes_differ() {
        let env = SystemEnv::new();
        let a: [u8; 32] = env.random_array();
        let b: [u8; 32] = env.random_array();
        assert_ne!(a, b);
    }

    #[test]
    fn wall_clock_is_plausible() {
        // 2020-01-01T00:00:00Z
        assert!(SystemEnv::new().wall_clock_millis() > 1_577_836_800_000);
    }

    #[tokio::test]
    async fn sleep_waits() {
        let env = SystemEnv::new();
        let start = env.now();
        env.sleep(Duration::from_millis(20)).await;
        assert!(env.now() - start >= Duration::from_millis(20));
    }
}
