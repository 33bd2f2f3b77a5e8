//! Ciphertext framing.
//!
//! The relay transmits the ciphertext kind next to the body, so like frame
//! payloads the body carries only the inner struct.

use courier_proto::payloads::relay::CiphertextKind;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    aead::NONCE_SIZE,
    error::CryptoError,
    keys::{IdentityKey, PublicKey},
};

/// Message on an established chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Sender chain generation
    pub generation: u32,
    /// `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext including Poly1305 tag
    pub ciphertext: Vec<u8>,
}

/// First message of a session: the agreement inputs plus a ratchet message.
///
/// The initiator keeps sending this form until the responder's first reply
/// proves the session is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    /// Initiator registration id
    pub registration_id: u32,
    /// Responder signed pre-key the agreement used
    pub signed_pre_key_id: u32,
    /// Responder one-time pre-key the agreement used, if any
    pub one_time_pre_key_id: Option<u32>,
    /// Initiator ephemeral public key
    pub base_key: PublicKey,
    /// Initiator identity
    pub identity_key: IdentityKey,
    /// Encrypted content
    pub message: RatchetMessage,
}

/// Any session ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiphertextMessage {
    /// Session-initiating message
    PreKey(PreKeyMessage),
    /// Established-session message
    Ratchet(RatchetMessage),
}

impl CiphertextMessage {
    /// Wire kind of this message.
    pub fn kind(&self) -> CiphertextKind {
        match self {
            Self::PreKey(_) => CiphertextKind::Initial,
            Self::Ratchet(_) => CiphertextKind::Established,
        }
    }

    /// Encode the body.
    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        let mut buf = Vec::new();
        match self {
            Self::PreKey(inner) => ciborium::ser::into_writer(inner, &mut buf),
            Self::Ratchet(inner) => ciborium::ser::into_writer(inner, &mut buf),
        }
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Decode a body of the given kind.
    pub fn decode(kind: CiphertextKind, body: &[u8]) -> Result<Self, CryptoError> {
        Ok(match kind {
            CiphertextKind::Initial => Self::PreKey(decode_cbor(body)?),
            CiphertextKind::Established => Self::Ratchet(decode_cbor(body)?),
        })
    }
}

fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CryptoError> {
    ciborium::de::from_reader(bytes).map_err(|e| CryptoError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::IdentityKeyPair;

    fn ratchet_message() -> RatchetMessage {
        RatchetMessage { generation: 3, nonce: [9; NONCE_SIZE], ciphertext: vec![1, 2, 3] }
    }

    #[test]
    fn pre_key_message_survives_encoding() {
        let msg = CiphertextMessage::PreKey(PreKeyMessage {
            registration_id: 77,
            signed_pre_key_id: 1,
            one_time_pre_key_id: None,
            base_key: PublicKey::from_bytes([4; 32]),
            identity_key: IdentityKeyPair::from_seeds([1; 32], [2; 32]).public(),
            message: ratchet_message(),
        });

        let body = msg.encode().unwrap();
        assert_eq!(CiphertextMessage::decode(msg.kind(), &body).unwrap(), msg);
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let body = CiphertextMessage::Ratchet(ratchet_message()).encode().unwrap();

        assert!(matches!(
            CiphertextMessage::decode(CiphertextKind::Initial, &body),
            Err(CryptoError::Encoding(_))
        ));
    }
}
