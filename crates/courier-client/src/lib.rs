//! Courier Client
//!
//! The relay link and the wiring that turns the session core into a
//! working messenger.
//!
//! - [`TransportMachine`]: pure link state machine (status, backoff,
//!   heartbeat, auto-ack, request correlation)
//! - [`Transport`]: tokio driver executing its actions over a [`Connector`]
//! - [`EventBus`]: typed event surface with cancellable subscriptions
//! - [`RelayDirectory`]: key-bundle directory over relay requests
//! - [`Messenger`]: composition root and inbound pipeline
//! - `QuicConnector` (feature `quic`): production connector

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod connection;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod events;
pub mod messenger;
#[cfg(feature = "quic")]
pub mod quic;
pub mod system_env;
pub mod transport;

pub use config::{ClientConfig, TransportConfig};
pub use connection::{TransportAction, TransportMachine, TransportStatus, backoff_delay};
pub use credentials::{Credential, CredentialProvider, StaticCredentials};
pub use directory::RelayDirectory;
pub use error::{MessengerError, TransportError};
pub use events::{EventBus, EventKind, Subscription, TransportEvent};
pub use messenger::{InboundEvent, InboundMessage, Messenger};
#[cfg(feature = "quic")]
pub use quic::QuicConnector;
pub use system_env::SystemEnv;
pub use transport::{Connector, Link, LinkEvent, Transport};
