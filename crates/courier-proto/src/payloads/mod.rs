//! CBOR-encoded frame payloads.
//!
//! Headers are raw binary, payloads are CBOR. The opcode in the header
//! identifies the payload type, so only the inner struct is serialized (no
//! variant tag on the wire).
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode, enforced by exhaustive
//! matches in [`Payload::opcode`] and [`Payload::decode`].

pub mod content;
pub mod keys;
pub mod relay;
pub mod session;

use bytes::BufMut;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All frame payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    // Session control
    /// Client authentication
    Hello(session::Hello),
    /// Relay accepted the Hello
    HelloReply(session::HelloReply),
    /// Graceful close
    Goodbye(session::Goodbye),
    /// Empty keepalive
    Ping,
    /// Keepalive response
    Pong,

    // Relay
    /// Outbound ciphertext
    Data(relay::Data),
    /// Inbound ciphertext
    Envelope(relay::Envelope),
    /// Acknowledgment
    Ack(relay::Ack),

    // Key-bundle registry
    /// Publish key material
    KeyBundlePublish(keys::KeyBundlePublish),
    /// Publish accepted
    KeyBundlePublished(keys::KeyBundlePublished),
    /// Fetch a bundle
    KeyBundleFetch(keys::KeyBundleFetch),
    /// Fetched bundle
    KeyBundle(keys::KeyBundleReply),

    /// Error response
    Error(ErrorPayload),
}

/// Error payload for error frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code
    pub code: u16,
    /// Human-readable message
    pub message: String,
}

impl ErrorPayload {
    /// Hello rejected: missing, expired or revoked credential.
    pub const AUTH_FAILED: u16 = 0x0001;
    /// Frame could not be parsed.
    pub const INVALID_PAYLOAD: u16 = 0x0002;
    /// Recipient or bundle owner does not exist.
    pub const UNKNOWN_USER: u16 = 0x0003;
    /// Frame arrived before a successful Hello.
    pub const NOT_AUTHENTICATED: u16 = 0x0004;
    /// Relay-side failure.
    pub const INTERNAL: u16 = 0x0005;

    /// Create an authentication failure.
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self { code: Self::AUTH_FAILED, message: reason.into() }
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self { code: Self::INVALID_PAYLOAD, message: msg.into() }
    }

    /// Create an unknown user error.
    pub fn unknown_user(user_id: &str) -> Self {
        Self { code: Self::UNKNOWN_USER, message: format!("unknown user: {user_id}") }
    }

    /// Create a not-authenticated error.
    pub fn not_authenticated() -> Self {
        Self { code: Self::NOT_AUTHENTICATED, message: "hello required".to_string() }
    }
}

fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::HelloReply(_) => Opcode::HelloReply,
            Self::Goodbye(_) => Opcode::Goodbye,
            Self::Ping => Opcode::Ping,
            Self::Pong => Opcode::Pong,
            Self::Data(_) => Opcode::Data,
            Self::Envelope(_) => Opcode::Envelope,
            Self::Ack(_) => Opcode::Ack,
            Self::KeyBundlePublish(_) => Opcode::KeyBundlePublish,
            Self::KeyBundlePublished(_) => Opcode::KeyBundlePublished,
            Self::KeyBundleFetch(_) => Opcode::KeyBundleFetch,
            Self::KeyBundle(_) => Opcode::KeyBundle,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Encode the inner struct (no variant tag) into `dst`.
    ///
    /// Size limits are enforced later by [`Frame::encode`].
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Hello(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HelloReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Goodbye(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Ping | Self::Pong => Ok(()), // Zero-byte payloads
            Self::Data(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Envelope(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Ack(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::KeyBundlePublish(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::KeyBundlePublished(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::KeyBundleFetch(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::KeyBundle(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode a payload of type `opcode` from `bytes`.
    ///
    /// The size check runs before the CBOR parser sees any input.
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        let payload = match opcode {
            Opcode::Hello => Self::Hello(decode_cbor(bytes)?),
            Opcode::HelloReply => Self::HelloReply(decode_cbor(bytes)?),
            Opcode::Goodbye => Self::Goodbye(decode_cbor(bytes)?),
            Opcode::Ping => Self::Ping,
            Opcode::Pong => Self::Pong,
            Opcode::Data => Self::Data(decode_cbor(bytes)?),
            Opcode::Envelope => Self::Envelope(decode_cbor(bytes)?),
            Opcode::Ack => Self::Ack(decode_cbor(bytes)?),
            Opcode::KeyBundlePublish => Self::KeyBundlePublish(decode_cbor(bytes)?),
            Opcode::KeyBundlePublished => Self::KeyBundlePublished(decode_cbor(bytes)?),
            Opcode::KeyBundleFetch => Self::KeyBundleFetch(decode_cbor(bytes)?),
            Opcode::KeyBundle => Self::KeyBundle(decode_cbor(bytes)?),
            Opcode::Error => Self::Error(decode_cbor(bytes)?),
        };

        Ok(payload)
    }

    /// Convert into a frame, stamping the opcode into `header`.
    pub fn into_frame(self, mut header: FrameHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.opcode = self.opcode().to_u16().to_be_bytes();
        Ok(Frame::new(header, buf))
    }

    /// Convert into a frame with no request correlation.
    pub fn to_frame(self) -> Result<Frame> {
        let opcode = self.opcode();
        self.into_frame(FrameHeader::new(opcode))
    }

    /// Parse the payload of `frame`.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or(ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::relay::{CiphertextKind, Envelope};

    #[test]
    fn envelope_survives_framing() {
        let payload = Payload::Envelope(Envelope {
            id: "env-1".to_string(),
            source_id: "alice".to_string(),
            kind: CiphertextKind::Initial,
            ciphertext: vec![1, 2, 3],
            timestamp: 42,
        });

        let frame = payload.clone().to_frame().unwrap();
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::Envelope));
        assert_eq!(Payload::from_frame(&frame).unwrap(), payload);
    }

    #[test]
    fn ping_is_empty() {
        let frame = Payload::Ping.to_frame().unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(Payload::from_frame(&frame).unwrap(), Payload::Ping);
    }

    #[test]
    fn request_id_is_preserved() {
        let payload = Payload::Error(ErrorPayload::unknown_user("bob"));
        let frame = payload.into_frame(FrameHeader::with_request_id(Opcode::Error, 99)).unwrap();
        assert_eq!(frame.header.request_id(), 99);
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let frame = Payload::Ping.to_frame().unwrap();
        // A zero-byte body is not a valid Envelope
        assert!(matches!(
            Payload::decode(Opcode::Envelope, &frame.payload),
            Err(ProtocolError::CborDecode(_))
        ));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut frame = Payload::Ping.to_frame().unwrap();
        frame.header.opcode = 0x7777u16.to_be_bytes();
        assert_eq!(Payload::from_frame(&frame), Err(ProtocolError::UnknownOpcode(0x7777)));
    }
}
