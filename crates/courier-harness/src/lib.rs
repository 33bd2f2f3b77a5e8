//! Deterministic simulation harness for Courier scenario testing.
//!
//! Turmoil-based implementations of the relay, the transport connector and
//! the environment, for reproducible end-to-end tests of the session layer
//! under reconnects, redeliveries and lost session state.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks the relay ledger after a scenario: acks
//! only for delivered envelopes, acked envelopes gone from mailboxes,
//! one-time pre-keys handed out at most once. Use
//! [`InvariantRegistry::standard()`] for all of them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod peer;
pub mod relay;
pub mod sim_connector;
pub mod sim_env;
pub mod sim_relay;
pub mod wire;

pub use invariants::{Invariant, InvariantRegistry, InvariantResult, Violation};
pub use peer::{SimMessenger, TestPeer};
pub use relay::{ConnectionId, EnvelopeRef, RelayAction, RelaySnapshot, RelayState, RoutedMessage};
pub use sim_connector::SimConnector;
pub use sim_env::SimEnv;
pub use sim_relay::{RELAY_HOST, RELAY_PORT, SIMULATION_DURATION, SimRelay, simulation};
