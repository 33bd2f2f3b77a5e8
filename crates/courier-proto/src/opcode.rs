//! Frame opcodes.

/// Operation code carried in every frame header.
///
/// Values are grouped by range: `0x00xx` session control, `0x001x` message
/// relay, `0x002x` key-bundle registry. `Error` sits at the top of the first
/// page so it never collides with a future addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Client authentication (first frame on every connection)
    Hello = 0x0001,
    /// Relay accepted the Hello
    HelloReply = 0x0002,
    /// Graceful close
    Goodbye = 0x0003,
    /// Empty keepalive
    Ping = 0x0004,
    /// Keepalive response
    Pong = 0x0005,

    /// Outbound ciphertext for a recipient
    Data = 0x0010,
    /// Inbound ciphertext delivered by the relay
    Envelope = 0x0011,
    /// Acknowledgment of an envelope (client to relay) or of a data frame
    /// (relay to client)
    Ack = 0x0012,

    /// Upload signed pre-key and one-time pre-keys
    KeyBundlePublish = 0x0020,
    /// Relay confirmation of a publish
    KeyBundlePublished = 0x0021,
    /// Request another user's key bundle
    KeyBundleFetch = 0x0022,
    /// Key bundle response
    KeyBundle = 0x0023,

    /// Error response
    Error = 0x00FF,
}

impl Opcode {
    /// Raw wire value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire value. `None` if unrecognized.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        let opcode = match value {
            0x0001 => Self::Hello,
            0x0002 => Self::HelloReply,
            0x0003 => Self::Goodbye,
            0x0004 => Self::Ping,
            0x0005 => Self::Pong,
            0x0010 => Self::Data,
            0x0011 => Self::Envelope,
            0x0012 => Self::Ack,
            0x0020 => Self::KeyBundlePublish,
            0x0021 => Self::KeyBundlePublished,
            0x0022 => Self::KeyBundleFetch,
            0x0023 => Self::KeyBundle,
            0x00FF => Self::Error,
            _ => return None,
        };
        Some(opcode)
    }

    /// Whether frames with this opcode answer a correlated request.
    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(self, Self::KeyBundlePublished | Self::KeyBundle | Self::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_round_trip() {
        for opcode in [
            Opcode::Hello,
            Opcode::HelloReply,
            Opcode::Goodbye,
            Opcode::Ping,
            Opcode::Pong,
            Opcode::Data,
            Opcode::Envelope,
            Opcode::Ack,
            Opcode::KeyBundlePublish,
            Opcode::KeyBundlePublished,
            Opcode::KeyBundleFetch,
            Opcode::KeyBundle,
            Opcode::Error,
        ] {
            assert_eq!(Opcode::from_u16(opcode.to_u16()), Some(opcode));
        }
    }

    #[test]
    fn unknown_value_is_rejected() {
        assert_eq!(Opcode::from_u16(0x0BAD), None);
    }
}
