//! Property-based tests for frame and payload decoding.
//!
//! Decoding sees untrusted relay bytes, so it must reject malformed input
//! with an error rather than panicking, and well-formed frames must survive
//! the wire unchanged.

use courier_proto::{
    Frame, FrameHeader, Opcode, Payload,
    payloads::relay::{Ack, CiphertextKind, Data},
};
use proptest::prelude::*;

fn arbitrary_kind() -> impl Strategy<Value = CiphertextKind> {
    prop_oneof![Just(CiphertextKind::Initial), Just(CiphertextKind::Established)]
}

fn arbitrary_data() -> impl Strategy<Value = Payload> {
    (
        "[a-z0-9-]{1,16}",
        "[a-z]{1,12}",
        arbitrary_kind(),
        prop::collection::vec(any::<u8>(), 0..512),
        any::<u64>(),
    )
        .prop_map(|(message_id, recipient_id, kind, ciphertext, timestamp)| {
            Payload::Data(Data { message_id, recipient_id, kind, ciphertext, timestamp })
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn decode_never_panics_on_garbage(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(frame) = Frame::decode(&bytes) {
            let _ = Payload::from_frame(&frame);
        }
    }

    #[test]
    fn data_frames_survive_the_wire(payload in arbitrary_data(), request_id in any::<u32>()) {
        let frame = payload
            .clone()
            .into_frame(FrameHeader::with_request_id(Opcode::Data, request_id))
            .unwrap();
        let wire = frame.to_vec().unwrap();

        let decoded = Frame::decode(&wire).unwrap();
        prop_assert_eq!(decoded.header.request_id(), request_id);
        prop_assert_eq!(Payload::from_frame(&decoded).unwrap(), payload);
    }

    #[test]
    fn trailing_bytes_are_ignored(id in "[a-z0-9]{1,20}", trailer in prop::collection::vec(any::<u8>(), 1..64)) {
        let frame = Payload::Ack(Ack { id }).to_frame().unwrap();
        let mut wire = frame.to_vec().unwrap();
        wire.extend_from_slice(&trailer);

        prop_assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }
}
