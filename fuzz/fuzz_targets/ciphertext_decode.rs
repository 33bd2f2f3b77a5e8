//! Fuzz target for ciphertext bodies and sealed content
//!
//! Envelope bodies come straight off the relay from untrusted peers. Both
//! kinds must reject garbage without panicking.

#![no_main]

use courier_crypto::CiphertextMessage;
use courier_proto::payloads::{content::SealedContent, relay::CiphertextKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for kind in [CiphertextKind::Initial, CiphertextKind::Established] {
        if let Ok(message) = CiphertextMessage::decode(kind, data) {
            assert_eq!(message.kind(), kind);
            let _ = message.encode();
        }
    }

    let _ = SealedContent::from_bytes(data);
});
