//! Frame header with zero-copy parsing.
//!
//! The header is a fixed 16-byte big-endian structure. Clients and the relay
//! dispatch on it without touching the CBOR payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    Opcode,
    errors::{ProtocolError, Result},
};

/// Fixed 16-byte frame header (big-endian network byte order).
///
/// Fields are raw byte arrays so the struct has alignment 1 and every 16-byte
/// pattern is a valid value; untrusted bytes can be cast directly and then
/// validated.
///
/// ```text
/// 0       4   5   6       8               12              16
/// +-------+---+---+-------+---------------+---------------+
/// | magic |ver|rsv|opcode |  request_id   | payload_size  |
/// +-------+---+---+-------+---------------+---------------+
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    magic: [u8; 4],
    version: u8,
    reserved: u8,
    pub(crate) opcode: [u8; 2],
    request_id: [u8; 4],
    pub(crate) payload_size: [u8; 4],
}

impl FrameHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 16;

    /// Magic number: "CRLK" in ASCII.
    pub const MAGIC: u32 = 0x4352_4C4B;

    /// Current protocol version.
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (1 MiB). Ciphertexts are text or small control
    /// messages; attachments travel out of band.
    pub const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

    /// Create a header for `opcode` with no request correlation.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            reserved: 0,
            opcode: opcode.to_u16().to_be_bytes(),
            request_id: [0; 4],
            payload_size: [0; 4],
        }
    }

    /// Create a header for `opcode` correlated with `request_id`.
    #[must_use]
    pub fn with_request_id(opcode: Opcode, request_id: u32) -> Self {
        let mut header = Self::new(opcode);
        header.set_request_id(request_id);
        header
    }

    /// Parse a header from the front of `bytes` without copying.
    ///
    /// Validation runs cheapest first: length, magic, version, then the
    /// payload size claim.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let (header, _) = Self::ref_from_prefix(bytes).map_err(|_| {
            ProtocolError::FrameTooShort { expected: Self::SIZE, actual: bytes.len() }
        })?;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Operation code as raw u16.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// Operation code as enum. `None` if unrecognized.
    #[must_use]
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Client-assigned correlation id. Zero for unsolicited frames.
    #[must_use]
    pub fn request_id(&self) -> u32 {
        u32::from_be_bytes(self.request_id)
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Set the correlation id echoed back by the relay.
    pub fn set_request_id(&mut self, request_id: u32) {
        self.request_id = request_id.to_be_bytes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_header_parses_back() {
        let header = FrameHeader::with_request_id(Opcode::KeyBundleFetch, 7);
        let bytes = header.to_bytes();

        let parsed = FrameHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.opcode_enum(), Some(Opcode::KeyBundleFetch));
        assert_eq!(parsed.request_id(), 7);
        assert_eq!(parsed.payload_size(), 0);
        assert_eq!(parsed.version(), FrameHeader::VERSION);
    }

    #[test]
    fn rejects_short_buffer() {
        let result = FrameHeader::from_bytes(&[0u8; 10]);
        assert_eq!(result, Err(ProtocolError::FrameTooShort { expected: 16, actual: 10 }));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = FrameHeader::new(Opcode::Ping).to_bytes();
        bytes[0] = b'X';
        assert_eq!(FrameHeader::from_bytes(&bytes), Err(ProtocolError::InvalidMagic));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = FrameHeader::new(Opcode::Ping).to_bytes();
        bytes[4] = 9;
        assert_eq!(FrameHeader::from_bytes(&bytes), Err(ProtocolError::UnsupportedVersion(9)));
    }

    #[test]
    fn rejects_oversized_payload_claim() {
        let mut bytes = FrameHeader::new(Opcode::Data).to_bytes();
        bytes[12..16].copy_from_slice(&(FrameHeader::MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
