//! Frame type combining header and payload.
//!
//! A `Frame` is a pure data holder: header plus already-encoded payload
//! bytes. Use [`crate::Payload::into_frame`] and [`crate::Payload::from_frame`]
//! to move between frames and typed payloads.

use bytes::{BufMut, Bytes};

use crate::{
    FrameHeader,
    errors::{ProtocolError, Result},
};

/// Complete protocol frame.
///
/// Layout on the wire: `[FrameHeader: 16 bytes] + [payload: variable]`.
///
/// # Invariants
///
/// - `payload.len()` matches `header.payload_size()`. [`Frame::new`] sets the
///   size and [`Frame::decode`] verifies it.
/// - `payload.len()` never exceeds [`FrameHeader::MAX_PAYLOAD_SIZE`] on the
///   wire. [`Frame::encode`] is the enforcement point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,

    /// Raw payload bytes (CBOR, or empty for keepalives)
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame, setting the header's payload size from `payload`.
    ///
    /// Oversized payloads are accepted here and rejected by [`Frame::encode`].
    #[must_use]
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();

        // Lengths above u32::MAX saturate and are rejected by `encode`
        let payload_len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        header.payload_size = payload_len.to_be_bytes();

        Self { header, payload }
    }

    /// Empty frame for `opcode` (keepalives).
    #[must_use]
    pub fn empty(opcode: crate::Opcode) -> Self {
        Self::new(FrameHeader::new(opcode), Bytes::new())
    }

    /// Encode into `dst`: header followed by payload.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        debug_assert_eq!(self.payload.len(), self.header.payload_size() as usize);

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + self.payload.len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode one frame from the front of `bytes`.
    ///
    /// Only structural framing is validated. Trailing bytes past the claimed
    /// payload are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;

        let payload_size = header.payload_size() as usize;
        let total_size = FrameHeader::SIZE + payload_size;

        let Some(payload) = bytes.get(FrameHeader::SIZE..total_size) else {
            return Err(ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            });
        };

        Ok(Self { header: *header, payload: Bytes::copy_from_slice(payload) })
    }
}
