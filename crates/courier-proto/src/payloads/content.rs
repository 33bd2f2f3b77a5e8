//! Plaintext carried inside end-to-end ciphertexts.
//!
//! The relay never sees these; they are encoded before encryption and
//! decoded after decryption. Application bodies stay opaque bytes.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Decrypted content of a ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealedContent {
    /// Application payload (opaque to the session layer)
    Application(Vec<u8>),
    /// The sender rebuilt its session with us
    SessionReset(ResetNotice),
}

/// Notification that the sender tore down and rebuilt its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetNotice {
    /// Display name the sender wants us to know it by
    pub sender_name: String,
    /// Why the sender reset (diagnostic only)
    pub reason: String,
    /// Sender wall-clock time, Unix milliseconds
    pub sent_at_ms: u64,
}

impl SealedContent {
    /// Encode to CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_notice_survives_encoding() {
        let content = SealedContent::SessionReset(ResetNotice {
            sender_name: "alice".to_string(),
            reason: "decryption_failure".to_string(),
            sent_at_ms: 1_700_000_000_000,
        });

        let bytes = content.to_bytes().unwrap();
        assert_eq!(SealedContent::from_bytes(&bytes).unwrap(), content);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            SealedContent::from_bytes(&[0xFF, 0x00, 0x13]),
            Err(ProtocolError::CborDecode(_))
        ));
    }
}
