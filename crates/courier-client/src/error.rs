//! Client error types.

use courier_core::{
    DeliveryError, DirectoryError, PreKeyError, RecoveryError, SessionError,
};
use courier_proto::ProtocolError;
use thiserror::Error;

/// Relay transport failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No credential available. Re-authenticate before retrying.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The link is not open
    #[error("not connected to relay")]
    NotConnected,

    /// Opening or using the link failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Frame could not be encoded or decoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The relay answered a request with an error frame
    #[error("relay rejected request ({code}): {message}")]
    Rejected {
        /// Relay error code
        code: u16,
        /// Relay message
        message: String,
    },

    /// A request got no response in time
    #[error("request timed out")]
    Timeout,

    /// The link closed while a request was waiting
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Returns true if the operation may succeed once the link is back.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Connection(_) | Self::Timeout | Self::Closed)
    }
}

impl From<TransportError> for DirectoryError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout,
            TransportError::Rejected { code, message } => Self::Rejected { code, message },
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<TransportError> for DeliveryError {
    fn from(err: TransportError) -> Self {
        Self { reason: err.to_string() }
    }
}

/// Failures surfaced by the [`Messenger`](crate::Messenger).
#[derive(Error, Debug)]
pub enum MessengerError {
    /// Session layer failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Pre-key supply failure
    #[error(transparent)]
    PreKeys(#[from] PreKeyError),

    /// Recovery failure
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Delivery failure
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Sealed content could not be encoded or decoded
    #[error("content encoding failed: {0}")]
    Content(String),
}
