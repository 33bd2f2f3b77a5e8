//! Relay model.
//!
//! Action-based relay core: frames in, [`RelayAction`]s out, no I/O. The
//! relay authenticates connections, routes ciphertext into per-user
//! mailboxes, redelivers every unacknowledged envelope on each new
//! connection, and keeps the key-bundle registry. It hands out each
//! one-time pre-key at most once.
//!
//! Everything the relay does is recorded in a ledger so scenario tests can
//! check delivery and pre-key invariants after the fact.

use std::collections::{BTreeMap, HashMap, VecDeque};

use courier_proto::{
    ErrorPayload, Frame, FrameHeader, Payload,
    payloads::{
        keys::{KeyBundleData, KeyBundlePublish, KeyBundlePublished, KeyBundleReply, PreKeyData, SignedPreKeyData},
        relay::{Ack, CiphertextKind, Data, Envelope},
        session::{Hello, HelloReply, PROTOCOL_VERSION},
    },
};

/// Relay-assigned connection id.
pub type ConnectionId = u64;

/// Output of the relay core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    /// Write `frame` to `connection`
    Send {
        /// Target connection
        connection: ConnectionId,
        /// Frame to write
        frame: Frame,
    },
    /// Close `connection`
    Close {
        /// Target connection
        connection: ConnectionId,
        /// Reason, for logs
        reason: String,
    },
}

/// One ciphertext the relay accepted for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    /// Envelope id assigned by the relay
    pub envelope_id: String,
    /// Sender account
    pub from: String,
    /// Recipient account
    pub to: String,
    /// Ciphertext kind
    pub kind: CiphertextKind,
}

/// An envelope id in one user's mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvelopeRef {
    /// Mailbox owner
    pub user: String,
    /// Envelope id
    pub envelope_id: String,
}

/// Everything the relay has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaySnapshot {
    /// Routed ciphertexts, in order
    pub routed: Vec<RoutedMessage>,
    /// Every envelope transmission, redeliveries included
    pub transmissions: Vec<EnvelopeRef>,
    /// Every acknowledgment that removed an envelope
    pub acks: Vec<EnvelopeRef>,
    /// Unacknowledged envelope ids per user
    pub pending: BTreeMap<String, Vec<String>>,
    /// One-time pre-keys handed out, as (owner, key id)
    pub handed_out: Vec<(String, u32)>,
}

struct StoredBundle {
    identity_key: Vec<u8>,
    registration_id: u32,
    signed_pre_key: SignedPreKeyData,
    one_time_pre_keys: VecDeque<PreKeyData>,
}

/// Relay core.
#[derive(Default)]
pub struct RelayState {
    tokens: HashMap<String, String>,
    /// Open connections and the user each authenticated as
    connections: HashMap<ConnectionId, Option<String>>,
    online: HashMap<String, ConnectionId>,
    bundles: HashMap<String, StoredBundle>,
    mailboxes: HashMap<String, Vec<Envelope>>,
    next_envelope: u64,
    ledger: RelaySnapshot,
}

impl RelayState {
    /// Empty relay accepting any non-empty token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept `token` for `user` from now on.
    pub fn require_token(&mut self, user: &str, token: &str) {
        self.tokens.insert(user.to_string(), token.to_string());
    }

    /// A transport connection was accepted.
    pub fn connection_opened(&mut self, connection: ConnectionId) {
        self.connections.insert(connection, None);
    }

    /// A transport connection is gone.
    pub fn connection_closed(&mut self, connection: ConnectionId) {
        if let Some(Some(user)) = self.connections.remove(&connection)
            && self.online.get(&user) == Some(&connection)
        {
            self.online.remove(&user);
            tracing::debug!(%user, connection, "user offline");
        }
    }

    /// Process one frame from `connection`.
    pub fn handle_frame(&mut self, connection: ConnectionId, frame: &Frame) -> Vec<RelayAction> {
        let request_id = frame.header.request_id();
        let payload = match Payload::from_frame(frame) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(connection, error = %e, "undecodable frame");
                let error = Payload::Error(ErrorPayload::invalid_payload(e.to_string()));
                return reply(connection, request_id, error);
            },
        };

        match payload {
            Payload::Hello(hello) => self.hello(connection, hello),
            Payload::Goodbye(goodbye) => vec![RelayAction::Close { connection, reason: goodbye.reason }],
            Payload::Ping => reply(connection, 0, Payload::Pong),
            Payload::Pong => Vec::new(),
            other => match self.connections.get(&connection).cloned().flatten() {
                Some(user) => self.authenticated(connection, &user, request_id, other),
                None => {
                    reply(connection, request_id, Payload::Error(ErrorPayload::not_authenticated()))
                },
            },
        }
    }

    /// Drop `user`'s connection, as a network failure would.
    pub fn kick(&mut self, user: &str) -> Vec<RelayAction> {
        self.online
            .get(user)
            .map(|&connection| RelayAction::Close { connection, reason: "kicked".to_string() })
            .into_iter()
            .collect()
    }

    /// Whether `user` has an authenticated connection.
    pub fn is_online(&self, user: &str) -> bool {
        self.online.contains_key(user)
    }

    /// Unacknowledged envelopes for `user`.
    pub fn pending(&self, user: &str) -> usize {
        self.mailboxes.get(user).map_or(0, Vec::len)
    }

    /// One-time pre-keys the relay still holds for `user`.
    pub fn available_pre_keys(&self, user: &str) -> usize {
        self.bundles.get(user).map_or(0, |b| b.one_time_pre_keys.len())
    }

    /// Ciphertexts routed so far.
    pub fn routed(&self) -> &[RoutedMessage] {
        &self.ledger.routed
    }

    /// Copy of the ledger plus current mailboxes.
    pub fn snapshot(&self) -> RelaySnapshot {
        let mut snapshot = self.ledger.clone();
        snapshot.pending = self
            .mailboxes
            .iter()
            .filter(|(_, mailbox)| !mailbox.is_empty())
            .map(|(user, mailbox)| (user.clone(), mailbox.iter().map(|e| e.id.clone()).collect()))
            .collect();
        snapshot
    }

    fn hello(&mut self, connection: ConnectionId, hello: Hello) -> Vec<RelayAction> {
        let rejection = if hello.version != PROTOCOL_VERSION {
            Some(format!("unsupported protocol version {}", hello.version))
        } else if hello.auth_token.is_empty() {
            Some("missing token".to_string())
        } else if self.tokens.get(&hello.user_id).is_some_and(|t| *t != hello.auth_token) {
            Some("invalid token".to_string())
        } else {
            None
        };

        if let Some(reason) = rejection {
            tracing::info!(connection, user = %hello.user_id, %reason, "hello rejected");
            let mut actions = reply(connection, 0, Payload::Error(ErrorPayload::auth_failed(&reason)));
            actions.push(RelayAction::Close { connection, reason });
            return actions;
        }

        let user = hello.user_id;
        let mut actions = Vec::new();

        if let Some(previous) = self.online.insert(user.clone(), connection)
            && previous != connection
        {
            actions.push(RelayAction::Close {
                connection: previous,
                reason: "replaced by a newer connection".to_string(),
            });
        }
        self.connections.insert(connection, Some(user.clone()));
        tracing::debug!(%user, connection, "user online");

        actions.extend(reply(connection, 0, Payload::HelloReply(HelloReply { session_id: connection })));

        let queued = self.mailboxes.get(&user).cloned().unwrap_or_default();
        if !queued.is_empty() {
            tracing::debug!(%user, count = queued.len(), "redelivering unacknowledged envelopes");
        }
        for envelope in queued {
            actions.extend(self.transmit(connection, &user, envelope));
        }

        actions
    }

    fn authenticated(
        &mut self,
        connection: ConnectionId,
        user: &str,
        request_id: u32,
        payload: Payload,
    ) -> Vec<RelayAction> {
        match payload {
            Payload::Data(data) => self.route(connection, user, data),
            Payload::Ack(ack) => {
                self.acknowledge(user, &ack.id);
                Vec::new()
            },
            Payload::KeyBundlePublish(publish) => {
                let available = self.publish(user, publish);
                reply(connection, request_id, Payload::KeyBundlePublished(KeyBundlePublished { available }))
            },
            Payload::KeyBundleFetch(fetch) => {
                let bundle = self.take_bundle(&fetch.user_id);
                reply(
                    connection,
                    request_id,
                    Payload::KeyBundle(KeyBundleReply { user_id: fetch.user_id, bundle }),
                )
            },
            other => {
                let message = format!("unexpected {:?} from client", other.opcode());
                reply(connection, request_id, Payload::Error(ErrorPayload::invalid_payload(message)))
            },
        }
    }

    fn route(&mut self, connection: ConnectionId, from: &str, data: Data) -> Vec<RelayAction> {
        self.next_envelope += 1;
        let envelope = Envelope {
            id: format!("env-{}", self.next_envelope),
            source_id: from.to_string(),
            kind: data.kind,
            ciphertext: data.ciphertext,
            timestamp: data.timestamp,
        };
        self.ledger.routed.push(RoutedMessage {
            envelope_id: envelope.id.clone(),
            from: from.to_string(),
            to: data.recipient_id.clone(),
            kind: data.kind,
        });
        tracing::debug!(%from, to = %data.recipient_id, envelope = %envelope.id, "routing ciphertext");

        self.mailboxes.entry(data.recipient_id.clone()).or_default().push(envelope.clone());

        let mut actions = Vec::new();
        if let Some(&recipient) = self.online.get(&data.recipient_id) {
            actions.extend(self.transmit(recipient, &data.recipient_id, envelope));
        }
        actions.extend(reply(connection, 0, Payload::Ack(Ack { id: data.message_id })));
        actions
    }

    fn transmit(&mut self, connection: ConnectionId, user: &str, envelope: Envelope) -> Vec<RelayAction> {
        self.ledger
            .transmissions
            .push(EnvelopeRef { user: user.to_string(), envelope_id: envelope.id.clone() });
        reply(connection, 0, Payload::Envelope(envelope))
    }

    fn acknowledge(&mut self, user: &str, envelope_id: &str) {
        let Some(mailbox) = self.mailboxes.get_mut(user) else {
            tracing::debug!(%user, envelope_id, "ack for empty mailbox");
            return;
        };
        let before = mailbox.len();
        mailbox.retain(|e| e.id != envelope_id);
        if mailbox.len() < before {
            self.ledger
                .acks
                .push(EnvelopeRef { user: user.to_string(), envelope_id: envelope_id.to_string() });
        } else {
            tracing::debug!(%user, envelope_id, "duplicate or unknown ack");
        }
    }

    fn publish(&mut self, user: &str, publish: KeyBundlePublish) -> u32 {
        let bundle = self.bundles.entry(user.to_string()).or_insert_with(|| StoredBundle {
            identity_key: publish.identity_key.clone(),
            registration_id: publish.registration_id,
            signed_pre_key: publish.signed_pre_key.clone(),
            one_time_pre_keys: VecDeque::new(),
        });

        // A new identity means a new device: its predecessor's keys are useless
        if bundle.identity_key != publish.identity_key {
            tracing::info!(%user, "identity key replaced, dropping old one-time pre-keys");
            bundle.one_time_pre_keys.clear();
        }

        bundle.identity_key = publish.identity_key;
        bundle.registration_id = publish.registration_id;
        bundle.signed_pre_key = publish.signed_pre_key;
        bundle.one_time_pre_keys.extend(publish.one_time_pre_keys);

        tracing::debug!(%user, available = bundle.one_time_pre_keys.len(), "key bundle published");
        bundle.one_time_pre_keys.len() as u32
    }

    fn take_bundle(&mut self, owner: &str) -> Option<KeyBundleData> {
        let bundle = self.bundles.get_mut(owner)?;
        let one_time_pre_key = bundle.one_time_pre_keys.pop_front();
        if let Some(key) = &one_time_pre_key {
            self.ledger.handed_out.push((owner.to_string(), key.key_id));
        }

        Some(KeyBundleData {
            identity_key: bundle.identity_key.clone(),
            registration_id: bundle.registration_id,
            signed_pre_key: bundle.signed_pre_key.clone(),
            one_time_pre_key,
        })
    }
}

/// Frame `payload` for `connection`, echoing `request_id`.
fn reply(connection: ConnectionId, request_id: u32, payload: Payload) -> Vec<RelayAction> {
    let opcode = payload.opcode();
    match payload.into_frame(FrameHeader::with_request_id(opcode, request_id)) {
        Ok(frame) => vec![RelayAction::Send { connection, frame }],
        Err(e) => {
            tracing::error!(connection, ?opcode, error = %e, "failed to encode reply");
            Vec::new()
        },
    }
}

#[cfg(test)]
mod tests {
    use courier_proto::payloads::keys::KeyBundleFetch;

    use super::*;

    fn frame(payload: Payload) -> Frame {
        payload.to_frame().unwrap()
    }

    fn request(payload: Payload, request_id: u32) -> Frame {
        let opcode = payload.opcode();
        payload.into_frame(FrameHeader::with_request_id(opcode, request_id)).unwrap()
    }

    fn hello(user: &str, token: &str) -> Frame {
        frame(Payload::Hello(Hello {
            version: PROTOCOL_VERSION,
            user_id: user.into(),
            auth_token: token.into(),
        }))
    }

    fn data(to: &str, message_id: &str) -> Frame {
        frame(Payload::Data(Data {
            message_id: message_id.into(),
            recipient_id: to.into(),
            kind: CiphertextKind::Initial,
            ciphertext: vec![1, 2, 3],
            timestamp: 0,
        }))
    }

    fn sent(actions: &[RelayAction]) -> Vec<(ConnectionId, u32, Payload)> {
        actions
            .iter()
            .filter_map(|action| match action {
                RelayAction::Send { connection, frame } => Some((
                    *connection,
                    frame.header.request_id(),
                    Payload::from_frame(frame).unwrap(),
                )),
                RelayAction::Close { .. } => None,
            })
            .collect()
    }

    fn online(relay: &mut RelayState, connection: ConnectionId, user: &str) -> Vec<RelayAction> {
        relay.connection_opened(connection);
        relay.handle_frame(connection, &hello(user, "token"))
    }

    fn publish(one_time: &[u32]) -> Payload {
        Payload::KeyBundlePublish(KeyBundlePublish {
            identity_key: vec![7; 64],
            registration_id: 42,
            signed_pre_key: SignedPreKeyData { key_id: 1, public_key: vec![1; 32], signature: vec![2; 64] },
            one_time_pre_keys: one_time
                .iter()
                .map(|&key_id| PreKeyData { key_id, public_key: vec![3; 32] })
                .collect(),
        })
    }

    #[test]
    fn frames_before_hello_are_rejected() {
        let mut relay = RelayState::new();
        relay.connection_opened(1);

        let actions = relay.handle_frame(1, &data("bob", "m1"));
        match &sent(&actions)[..] {
            [(1, _, Payload::Error(error))] => assert_eq!(error.code, ErrorPayload::NOT_AUTHENTICATED),
            other => panic!("unexpected actions {other:?}"),
        }
        assert!(relay.routed().is_empty());
    }

    #[test]
    fn wrong_token_fails_auth_and_closes() {
        let mut relay = RelayState::new();
        relay.require_token("alice", "secret");
        relay.connection_opened(1);

        let actions = relay.handle_frame(1, &hello("alice", "guess"));

        assert!(matches!(&sent(&actions)[..], [(1, _, Payload::Error(e))] if e.code == ErrorPayload::AUTH_FAILED));
        assert!(matches!(actions.last(), Some(RelayAction::Close { connection: 1, .. })));
        assert!(!relay.is_online("alice"));
    }

    #[test]
    fn data_is_routed_and_acked_to_sender() {
        let mut relay = RelayState::new();
        online(&mut relay, 1, "alice");
        online(&mut relay, 2, "bob");

        let actions = relay.handle_frame(1, &data("bob", "m1"));
        let sent = sent(&actions);

        assert!(matches!(&sent[0], (2, 0, Payload::Envelope(e)) if e.source_id == "alice" && e.id == "env-1"));
        assert!(matches!(&sent[1], (1, 0, Payload::Ack(a)) if a.id == "m1"));
        assert_eq!(relay.pending("bob"), 1);

        relay.handle_frame(2, &frame(Payload::Ack(Ack { id: "env-1".into() })));
        assert_eq!(relay.pending("bob"), 0);
    }

    #[test]
    fn unacked_envelopes_are_redelivered_on_every_connection() {
        let mut relay = RelayState::new();
        online(&mut relay, 1, "alice");
        relay.handle_frame(1, &data("bob", "m1"));
        relay.handle_frame(1, &data("bob", "m2"));

        let first = online(&mut relay, 2, "bob");
        let ids = |actions: &[RelayAction]| -> Vec<String> {
            sent(actions)
                .into_iter()
                .filter_map(|(_, _, p)| match p {
                    Payload::Envelope(e) => Some(e.id),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(ids(&first), ["env-1", "env-2"]);

        relay.handle_frame(2, &frame(Payload::Ack(Ack { id: "env-1".into() })));
        relay.connection_closed(2);

        let second = online(&mut relay, 3, "bob");
        assert_eq!(ids(&second), ["env-2"]);
        assert_eq!(relay.snapshot().transmissions.len(), 3);
    }

    #[test]
    fn new_connection_replaces_old_one() {
        let mut relay = RelayState::new();
        online(&mut relay, 1, "alice");
        let actions = online(&mut relay, 2, "alice");

        assert!(actions.contains(&RelayAction::Close {
            connection: 1,
            reason: "replaced by a newer connection".into(),
        }));

        // The old connection closing must not take the user offline
        relay.connection_closed(1);
        assert!(relay.is_online("alice"));
    }

    #[test]
    fn each_one_time_pre_key_is_handed_out_once() {
        let mut relay = RelayState::new();
        online(&mut relay, 1, "bob");
        online(&mut relay, 2, "alice");

        let actions = relay.handle_frame(1, &request(publish(&[10, 11]), 5));
        assert!(matches!(&sent(&actions)[..], [(1, 5, Payload::KeyBundlePublished(p))] if p.available == 2));

        let fetch = |relay: &mut RelayState| {
            let actions = relay
                .handle_frame(2, &request(Payload::KeyBundleFetch(KeyBundleFetch { user_id: "bob".into() }), 9));
            match sent(&actions).pop() {
                Some((2, 9, Payload::KeyBundle(reply))) => reply.bundle.unwrap(),
                other => panic!("unexpected reply {other:?}"),
            }
        };

        assert_eq!(fetch(&mut relay).one_time_pre_key.map(|k| k.key_id), Some(10));
        assert_eq!(fetch(&mut relay).one_time_pre_key.map(|k| k.key_id), Some(11));
        assert_eq!(fetch(&mut relay).one_time_pre_key, None);
        assert_eq!(relay.snapshot().handed_out, [("bob".to_string(), 10), ("bob".to_string(), 11)]);
    }

    #[test]
    fn unknown_bundle_is_none() {
        let mut relay = RelayState::new();
        online(&mut relay, 1, "alice");

        let actions =
            relay.handle_frame(1, &request(Payload::KeyBundleFetch(KeyBundleFetch { user_id: "nobody".into() }), 3));
        assert!(matches!(&sent(&actions)[..], [(1, 3, Payload::KeyBundle(r))] if r.bundle.is_none()));
    }

    #[test]
    fn kick_closes_only_online_users() {
        let mut relay = RelayState::new();
        online(&mut relay, 4, "alice");

        assert_eq!(relay.kick("alice"), vec![RelayAction::Close { connection: 4, reason: "kicked".into() }]);
        assert!(relay.kick("bob").is_empty());
    }
}
