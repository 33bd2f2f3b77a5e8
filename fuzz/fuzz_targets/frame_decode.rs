//! Fuzz target for `Frame::decode`
//!
//! Arbitrary bytes must never panic the frame parser. A decoded frame that
//! re-encodes must reproduce the bytes it was read from.

#![no_main]

use courier_proto::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = Frame::decode(data) else {
        return;
    };

    let mut buf = Vec::new();
    if frame.encode(&mut buf).is_ok() {
        assert_eq!(&buf[..], &data[..buf.len()]);
    }
});
