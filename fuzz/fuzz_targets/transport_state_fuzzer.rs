//! Fuzz target for the transport state machine
//!
//! Drives `TransportMachine` with arbitrary sequences of driver callbacks,
//! including stale timers, frames in the wrong state and missing
//! credentials.
//!
//! # Invariants
//!
//! - Reconnect attempts never exceed the configured maximum
//! - Attempt `n` is scheduled with delay `base * 2^(n-1)`
//! - Only `Connected` produces keepalives
//! - `Failed` is left only through an explicit connect

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use bytes::Bytes;
use courier_client::{
    TransportAction, TransportConfig, TransportMachine, TransportStatus, backoff_delay,
    credentials::Credential,
};
use courier_proto::{Frame, FrameHeader, Opcode};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Connect { with_credential: bool },
    Opened,
    OpenFailed { with_credential: bool },
    Closed { code: Option<u32>, with_credential: bool },
    ReconnectDue { attempt: u8, with_credential: bool },
    Frame { opcode: u16, request_id: u32, payload: Vec<u8> },
    Tick { advance_secs: u8 },
    Disconnect,
}

fn credential() -> Credential {
    Credential { user_id: "fuzz".into(), token: "token".into() }
}

fuzz_target!(|ops: Vec<Op>| {
    let config = TransportConfig::default();
    let max_attempts = config.max_reconnect_attempts;
    let base = config.reconnect_base_delay;
    let mut machine: TransportMachine<Duration> = TransportMachine::new(config);
    let mut now = Duration::ZERO;

    for op in ops {
        let before = machine.status();
        let explicit_connect = matches!(op, Op::Connect { .. });

        let actions = match op {
            Op::Connect { with_credential } => {
                let credential = with_credential.then(credential);
                machine.begin_connect(credential.as_ref()).unwrap_or_default()
            },
            Op::Opened => machine.handle_opened(&credential(), now).unwrap_or_default(),
            Op::OpenFailed { with_credential } => machine.handle_open_failed("fuzz", with_credential),
            Op::Closed { code, with_credential } => machine.handle_closed(code, with_credential),
            Op::ReconnectDue { attempt, with_credential } => {
                machine.handle_reconnect_due(u32::from(attempt), with_credential)
            },
            Op::Frame { opcode, request_id, payload } => {
                let Some(opcode) = Opcode::from_u16(opcode) else {
                    continue;
                };
                let frame = Frame::new(FrameHeader::with_request_id(opcode, request_id), Bytes::from(payload));
                machine.handle_frame(&frame)
            },
            Op::Tick { advance_secs } => {
                now += Duration::from_secs(u64::from(advance_secs));
                machine.tick(now)
            },
            Op::Disconnect => machine.disconnect("fuzz"),
        };

        assert!(machine.reconnect_attempts() <= max_attempts);

        for action in &actions {
            match action {
                TransportAction::ScheduleReconnect { attempt, delay } => {
                    assert!(*attempt >= 1 && *attempt <= max_attempts);
                    assert_eq!(*delay, backoff_delay(base, *attempt));
                },
                TransportAction::SendFrame(frame) if frame.header.opcode() == Opcode::Ping.to_u16() => {
                    assert_eq!(machine.status(), TransportStatus::Connected);
                    assert!(frame.payload.is_empty());
                },
                _ => {},
            }
        }

        if before == TransportStatus::Failed && !explicit_connect {
            assert!(matches!(machine.status(), TransportStatus::Failed | TransportStatus::Disconnected));
        }
    }
});
