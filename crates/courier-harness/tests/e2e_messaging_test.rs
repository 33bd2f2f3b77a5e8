//! End-to-end messaging through the simulated relay.
//!
//! Real ratchet sessions, real transports, turmoil network.

use std::time::Duration;

use courier_core::PreKeyConfig;
use courier_harness::{InvariantRegistry, RELAY_HOST, SimRelay, TestPeer, simulation};
use courier_proto::payloads::relay::CiphertextKind;

fn text(from: &str, body: &str) -> Option<(String, String)> {
    Some((from.to_string(), body.to_string()))
}

#[test]
fn first_contact_is_initial_then_established() {
    let relay = SimRelay::new();
    let mut sim = simulation(&relay);

    sim.client("devices", async move {
        let mut alice = TestPeer::online("alice", RELAY_HOST, 1).await?;
        let mut bob = TestPeer::online("bob", RELAY_HOST, 2).await?;
        assert_eq!(relay.available_pre_keys("bob"), 100);

        alice.send_text("bob", "hello bob").await?;
        assert_eq!(bob.next_text().await, text("alice", "hello bob"));

        bob.send_text("alice", "hi alice").await?;
        assert_eq!(alice.next_text().await, text("bob", "hi alice"));

        alice.send_text("bob", "how are you").await?;
        assert_eq!(bob.next_text().await, text("alice", "how are you"));

        let kinds: Vec<_> =
            relay.snapshot().routed.iter().map(|m| (m.from.clone(), m.kind)).collect();
        assert_eq!(kinds, vec![
            ("alice".to_string(), CiphertextKind::Initial),
            ("bob".to_string(), CiphertextKind::Established),
            ("alice".to_string(), CiphertextKind::Established),
        ]);

        // Only alice opened a session, consuming one of bob's one-time keys
        assert_eq!(relay.available_pre_keys("bob"), 99);
        assert_eq!(relay.available_pre_keys("alice"), 100);
        assert_eq!(bob.messenger().pre_key_status()?.count, 99);

        tokio::time::sleep(Duration::from_millis(100)).await;
        InvariantRegistry::standard().assert_all(&relay.snapshot(), "after first contact");
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn offline_recipient_gets_mailbox_on_connect() {
    let relay = SimRelay::new();
    let mut sim = simulation(&relay);

    sim.client("devices", async move {
        let alice = TestPeer::online("alice", RELAY_HOST, 3).await?;
        let mut bob = TestPeer::online("bob", RELAY_HOST, 4).await?;

        bob.messenger().disconnect();
        alice.send_text("bob", "first").await?;
        alice.send_text("bob", "second").await?;
        assert_eq!(relay.pending("bob"), 2);
        assert_eq!(bob.next_message().await, None);

        bob.connect().await?;
        assert_eq!(bob.next_text().await, text("alice", "first"));
        assert_eq!(bob.next_text().await, text("alice", "second"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.pending("bob"), 0);
        InvariantRegistry::standard().assert_all(&relay.snapshot(), "after mailbox drain");
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn concurrent_sends_share_one_session() {
    let relay = SimRelay::new();
    let mut sim = simulation(&relay);

    sim.client("devices", async move {
        let alice = TestPeer::online("alice", RELAY_HOST, 5).await?;
        let mut bob = TestPeer::online("bob", RELAY_HOST, 6).await?;

        let (a, b, c) = tokio::join!(
            alice.send_text("bob", "one"),
            alice.send_text("bob", "two"),
            alice.send_text("bob", "three"),
        );
        a?;
        b?;
        c?;

        let mut received = Vec::new();
        for _ in 0..3 {
            let (from, body) = bob.next_text().await.expect("message delivered");
            assert_eq!(from, "alice");
            received.push(body);
        }
        received.sort();
        assert_eq!(received, ["one", "three", "two"]);

        // One bundle fetch, one one-time key, one session
        assert_eq!(relay.snapshot().handed_out, [("bob".to_string(), 1)]);
        assert!(alice.messenger().has_session("bob")?);
        assert_eq!(bob.messenger().pre_key_status()?.count, 99);
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn low_supply_is_replenished_after_reconnect() {
    let relay = SimRelay::new();
    let mut sim = simulation(&relay);

    sim.client("devices", async move {
        let mut config = TestPeer::config("bob", RELAY_HOST);
        config.pre_keys = PreKeyConfig { threshold: 20, batch_size: 50, initial_batch_size: 22 };
        let mut bob = TestPeer::with_config("bob", 7, config);
        bob.connect().await?;
        bob.messenger().register().await?;
        assert_eq!(relay.available_pre_keys("bob"), 22);

        for (seed, name) in [(8, "carol"), (9, "dave"), (10, "erin")] {
            let sender = TestPeer::online(name, RELAY_HOST, seed).await?;
            sender.send_text("bob", "hi").await?;
            assert_eq!(bob.next_text().await, text(name, "hi"));
        }

        let status = bob.messenger().pre_key_status()?;
        assert_eq!(status.count, 19);
        assert!(status.needs_replenishment);

        bob.messenger().disconnect();
        bob.connect().await?;

        let mut waited = Duration::ZERO;
        while relay.available_pre_keys("bob") != 69 && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += Duration::from_millis(50);
        }
        assert_eq!(relay.available_pre_keys("bob"), 19 + 50);
        assert_eq!(bob.messenger().pre_key_status()?.count, 69);

        InvariantRegistry::standard().assert_all(&relay.snapshot(), "after replenishment");
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn unknown_recipient_fails_without_session() {
    let relay = SimRelay::new();
    let mut sim = simulation(&relay);

    sim.client("devices", async move {
        let alice = TestPeer::online("alice", RELAY_HOST, 11).await?;

        let result = alice.send_text("nobody", "hello?").await;
        assert!(result.is_err());
        assert!(!alice.messenger().has_session("nobody")?);
        assert!(relay.snapshot().routed.is_empty());
        Ok(())
    });

    sim.run().expect("simulation failed");
}
