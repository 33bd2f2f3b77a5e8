//! Protocol errors.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while framing or parsing relay traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is shorter than a frame header
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Header magic does not identify a Courier frame
    #[error("invalid magic number")]
    InvalidMagic,

    /// Header version is not one we speak
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds the protocol limit
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Claimed or actual payload size
        size: usize,
        /// Protocol maximum
        max: usize,
    },

    /// Fewer payload bytes than the header claims
    #[error("frame truncated: expected {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Payload bytes claimed by the header
        expected: usize,
        /// Payload bytes present
        actual: usize,
    },

    /// Opcode is not part of the protocol
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// CBOR serialization failed
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),
}
