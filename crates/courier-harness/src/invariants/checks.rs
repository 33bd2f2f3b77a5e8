//! Relay invariant checks.

use std::collections::HashSet;

use super::{Invariant, InvariantResult, Violation};
use crate::relay::{EnvelopeRef, RelaySnapshot};

/// An envelope can only be acknowledged by a user it was sent to.
///
/// An ack for an envelope the relay never transmitted to that user means
/// ids leaked across mailboxes.
pub struct AckedEnvelopesWereDelivered;

impl Invariant for AckedEnvelopesWereDelivered {
    fn name(&self) -> &'static str {
        "AckedEnvelopesWereDelivered"
    }

    fn check(&self, state: &RelaySnapshot) -> InvariantResult {
        let transmitted: HashSet<&EnvelopeRef> = state.transmissions.iter().collect();
        match state.acks.iter().find(|ack| !transmitted.contains(ack)) {
            Some(ack) => Err(Violation {
                invariant: self.name(),
                message: format!("{} acked {} which was never delivered to it", ack.user, ack.envelope_id),
            }),
            None => Ok(()),
        }
    }
}

/// Acknowledged envelopes are never delivered again.
pub struct AckedEnvelopesLeftMailbox;

impl Invariant for AckedEnvelopesLeftMailbox {
    fn name(&self) -> &'static str {
        "AckedEnvelopesLeftMailbox"
    }

    fn check(&self, state: &RelaySnapshot) -> InvariantResult {
        for ack in &state.acks {
            let still_pending = state
                .pending
                .get(&ack.user)
                .is_some_and(|ids| ids.iter().any(|id| *id == ack.envelope_id));
            if still_pending {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("{} still pending for {} after ack", ack.envelope_id, ack.user),
                });
            }
        }
        Ok(())
    }
}

/// Each one-time pre-key reaches at most one requester.
///
/// Handing the same key out twice lets two peers derive sessions from the
/// same one-time secret.
pub struct PreKeysHandedOutOnce;

impl Invariant for PreKeysHandedOutOnce {
    fn name(&self) -> &'static str {
        "PreKeysHandedOutOnce"
    }

    fn check(&self, state: &RelaySnapshot) -> InvariantResult {
        let mut seen = HashSet::new();
        for (owner, key_id) in &state.handed_out {
            if !seen.insert((owner, key_id)) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("pre-key {key_id} of {owner} handed out twice"),
                });
            }
        }
        Ok(())
    }
}
