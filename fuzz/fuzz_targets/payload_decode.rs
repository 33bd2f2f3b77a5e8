//! Fuzz target for `Payload::from_frame`
//!
//! Feeds arbitrary CBOR under every opcode: malformed input, type confusion
//! between opcodes, oversized strings. Decoding returns errors, never panics.

#![no_main]

use bytes::Bytes;
use courier_proto::{Frame, FrameHeader, Opcode, Payload};
use libfuzzer_sys::fuzz_target;

const OPCODES: [Opcode; 13] = [
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
];

fuzz_target!(|data: &[u8]| {
    for opcode in OPCODES {
        let frame = Frame::new(FrameHeader::with_request_id(opcode, 7), Bytes::copy_from_slice(data));
        if let Ok(payload) = Payload::from_frame(&frame) {
            assert_eq!(payload.opcode(), opcode);
        }
    }
});
