//! Relay link failures in simulation.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use courier_client::{EventKind, TransportEvent, TransportStatus};
use courier_harness::{InvariantRegistry, RELAY_HOST, SimRelay, TestPeer, simulation};

fn text(from: &str, body: &str) -> Option<(String, String)> {
    Some((from.to_string(), body.to_string()))
}

#[test]
fn dropped_link_reconnects_and_redelivers() {
    let relay = SimRelay::new();
    let mut sim = simulation(&relay);

    sim.client("devices", async move {
        let alice = TestPeer::online("alice", RELAY_HOST, 31).await?;
        let mut bob = TestPeer::online("bob", RELAY_HOST, 32).await?;

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        let _subscription = bob.messenger().transport().subscribe(EventKind::Status, move |event| {
            if let TransportEvent::Status(status) = event {
                sink.lock().unwrap().push(*status);
            }
        });

        let attempts = bob.connector().attempts();
        relay.kick("bob");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!relay.is_online("bob"));
        assert_eq!(bob.messenger().transport().status(), TransportStatus::Reconnecting { attempt: 1 });

        alice.send_text("bob", "while you were away").await?;
        assert_eq!(bob.next_text().await, text("alice", "while you were away"));

        assert!(bob.messenger().is_connected());
        assert_eq!(bob.connector().attempts(), attempts + 1);
        assert_eq!(statuses.lock().unwrap().clone(), vec![
            TransportStatus::Disconnected,
            TransportStatus::Reconnecting { attempt: 1 },
            TransportStatus::Connecting,
            TransportStatus::Connected,
        ]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.pending("bob"), 0);
        InvariantRegistry::standard().assert_all(&relay.snapshot(), "after reconnect");
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn gives_up_after_five_attempts_until_explicit_connect() {
    let relay = SimRelay::new();
    let mut sim = simulation(&relay);

    sim.client("devices", async move {
        let bob = TestPeer::online("bob", RELAY_HOST, 33).await?;

        let attempts = bob.connector().attempts();
        bob.connector().refuse_connections(true);
        relay.kick("bob");

        // Retries fire 1, 3, 7, 15 and 31 seconds after the drop
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(bob.connector().attempts(), attempts + 4);
        assert_eq!(bob.messenger().transport().status(), TransportStatus::Reconnecting { attempt: 5 });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(bob.connector().attempts(), attempts + 5);
        assert_eq!(bob.messenger().transport().status(), TransportStatus::Failed);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(bob.connector().attempts(), attempts + 5);

        bob.connector().refuse_connections(false);
        bob.connect().await?;
        assert!(relay.is_online("bob"));
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn rejected_credentials_fail_without_retry() {
    let relay = SimRelay::new();
    relay.require_token("mallory", "the-real-token");
    let mut sim = simulation(&relay);

    sim.client("devices", async move {
        let mallory = TestPeer::new("mallory", RELAY_HOST, 34);

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let _subscription = mallory.messenger().transport().subscribe(EventKind::Error, move |event| {
            if let TransportEvent::Error(message) = event {
                sink.lock().unwrap().push(message.clone());
            }
        });

        // The link opens; the relay rejects the hello afterwards
        let _ = mallory.connect().await;
        let attempts = mallory.connector().attempts();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(mallory.messenger().transport().status(), TransportStatus::Failed);
        assert_eq!(mallory.connector().attempts(), attempts);
        assert!(!relay.is_online("mallory"));
        assert!(!errors.lock().unwrap().is_empty());
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn link_stays_up_across_idle_periods() {
    let relay = SimRelay::new();
    let mut sim = simulation(&relay);

    sim.client("devices", async move {
        let alice = TestPeer::online("alice", RELAY_HOST, 35).await?;
        let mut bob = TestPeer::online("bob", RELAY_HOST, 36).await?;

        let attempts = bob.connector().attempts();
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(bob.messenger().is_connected());
        assert_eq!(bob.connector().attempts(), attempts);

        alice.send_text("bob", "still there?").await?;
        assert_eq!(bob.next_text().await, text("alice", "still there?"));
        Ok(())
    });

    sim.run().expect("simulation failed");
}
