//! Environment abstraction for deterministic testing.
//!
//! Decouples session logic from system resources (time, randomness). Tests
//! drive a virtual clock and a seeded RNG; production uses the system clock
//! and OS entropy.

use std::time::Duration;

/// Abstract environment providing time, randomness, and sleeping.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    ///
    /// Production uses `std::time::Instant`; simulations use a virtual clock.
    type Instant: Copy + Ord + Send + Sync + std::fmt::Debug + std::ops::Sub<Output = Duration>;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Wall-clock time in Unix milliseconds, for timestamps that leave the
    /// process (trust records, reset notices, signed pre-keys).
    fn wall_clock_millis(&self) -> u64;

    /// Sleep for `duration`.
    ///
    /// Only driver code sleeps; session logic never does.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u32`.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    /// Random `u64`, used for message and request ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Random fixed-size array, used for key seeds and nonces.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }
}
