//! Invariant checking for relay simulations.
//!
//! Invariants are properties of the relay ledger that must hold after any
//! scenario, however messages, reconnects and resets interleaved. Scenario
//! tests take a [`RelaySnapshot`] at the end and run the registry over it.
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! registry.assert_all(&relay.snapshot(), "after reconnect storm");
//! ```

mod checks;

pub use checks::{AckedEnvelopesLeftMailbox, AckedEnvelopesWereDelivered, PreKeysHandedOutOnce};

use crate::relay::RelaySnapshot;

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property of the relay ledger.
pub trait Invariant: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against a snapshot.
    fn check(&self, state: &RelaySnapshot) -> InvariantResult;
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with every relay invariant:
    ///
    /// - [`AckedEnvelopesWereDelivered`]
    /// - [`AckedEnvelopesLeftMailbox`]
    /// - [`PreKeysHandedOutOnce`]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(AckedEnvelopesWereDelivered);
        registry.add(AckedEnvelopesLeftMailbox);
        registry.add(PreKeysHandedOutOnce);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants, collecting every violation.
    pub fn check_all(&self, state: &RelaySnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation.
    #[allow(clippy::panic, reason = "test harness assertion")]
    pub fn assert_all(&self, state: &RelaySnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::EnvelopeRef;

    fn envelope(user: &str, id: &str) -> EnvelopeRef {
        EnvelopeRef { user: user.into(), envelope_id: id.into() }
    }

    #[test]
    fn standard_registry_has_invariants() {
        let registry = InvariantRegistry::standard();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn empty_ledger_passes() {
        assert!(InvariantRegistry::standard().check_all(&RelaySnapshot::default()).is_ok());
    }

    #[test]
    fn violations_are_collected() {
        let snapshot = RelaySnapshot {
            acks: vec![envelope("bob", "env-1")],
            handed_out: vec![("bob".into(), 3), ("bob".into(), 3)],
            ..RelaySnapshot::default()
        };

        let violations = InvariantRegistry::standard().check_all(&snapshot).unwrap_err();
        let names: Vec<_> = violations.iter().map(|v| v.invariant).collect();
        assert_eq!(names, ["AckedEnvelopesWereDelivered", "PreKeysHandedOutOnce"]);
    }

    #[test]
    #[should_panic(expected = "Invariant violation at end")]
    fn assert_all_panics_with_context() {
        let snapshot = RelaySnapshot {
            transmissions: vec![envelope("bob", "env-1")],
            acks: vec![envelope("bob", "env-1")],
            pending: [("bob".to_string(), vec!["env-1".to_string()])].into(),
            ..RelaySnapshot::default()
        };
        InvariantRegistry::standard().assert_all(&snapshot, "at end");
    }
}
