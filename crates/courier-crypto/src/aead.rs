//! Message encryption using `XChaCha20-Poly1305`.
//!
//! Pure functions: the nonce is supplied by the caller.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::{error::CryptoError, ratchet::MessageKey};

/// `XChaCha20` nonce size.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under `key`, authenticating `aad`.
pub fn seal(key: &MessageKey, nonce: &[u8; NONCE_SIZE], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.key().into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

/// Decrypt `ciphertext` under `key`, checking `aad`.
pub fn open(
    key: &MessageKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DecryptionFailed {
            reason: format!("ciphertext shorter than tag: {} bytes", ciphertext.len()),
        });
    }

    let cipher = XChaCha20Poly1305::new(key.key().into());
    cipher.decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad }).map_err(|_| {
        CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratchet::SymmetricRatchet;

    fn key() -> MessageKey {
        SymmetricRatchet::new(&[7; 32]).advance().unwrap()
    }

    #[test]
    fn seal_then_open() {
        let key = key();
        let sealed = seal(&key, &[1; NONCE_SIZE], b"ad", b"hello");

        assert_eq!(sealed.len(), 5 + TAG_SIZE);
        assert_eq!(open(&key, &[1; NONCE_SIZE], b"ad", &sealed).unwrap(), b"hello");
    }

    #[test]
    fn wrong_aad_fails() {
        let key = key();
        let sealed = seal(&key, &[1; NONCE_SIZE], b"ad", b"hello");

        assert!(open(&key, &[1; NONCE_SIZE], b"other", &sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = key();
        let mut sealed = seal(&key, &[1; NONCE_SIZE], b"ad", b"hello");
        sealed[0] ^= 0x80;

        assert!(matches!(
            open(&key, &[1; NONCE_SIZE], b"ad", &sealed),
            Err(CryptoError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn truncated_ciphertext_fails() {
        assert!(open(&key(), &[0; NONCE_SIZE], b"", &[0; 4]).is_err());
    }
}
