//! Courier relay wire protocol.
//!
//! Everything exchanged with the relay travels as a [`Frame`]: a fixed
//! 16-byte big-endian [`FrameHeader`] followed by a CBOR payload. The header
//! carries just enough to dispatch (opcode, request correlation id, payload
//! length) so the relay never has to parse payloads it only forwards.
//!
//! # Layers
//!
//! - [`FrameHeader`] / [`Frame`]: structural framing, zero-copy header parse
//! - [`Opcode`]: one opcode per payload variant
//! - [`Payload`]: typed CBOR bodies for session, relay and key-bundle traffic
//! - [`payloads::content::SealedContent`]: the plaintext shape carried inside
//!   end-to-end encrypted ciphertexts (never seen by the relay)
//!
//! Ciphertexts are opaque byte sequences at this layer. Their internal
//! structure belongs to the crypto engine.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
pub mod frame;
pub mod header;
pub mod opcode;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use opcode::Opcode;
pub use payloads::{ErrorPayload, Payload};
