//! Transport event surface.
//!
//! Subscribers register a handler for one [`EventKind`] (or for all of
//! them) and get a [`Subscription`] token back. Handlers run synchronously,
//! in subscription order, on the task that produced the event. They must not
//! block: forward into a channel if work is needed.

use std::sync::{Arc, Mutex};

use courier_proto::payloads::relay::Envelope;

use crate::connection::TransportStatus;

/// Event category, used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`TransportEvent::Status`]
    Status,
    /// [`TransportEvent::Connected`]
    Connected,
    /// [`TransportEvent::Disconnected`]
    Disconnected,
    /// [`TransportEvent::Envelope`]
    Envelope,
    /// [`TransportEvent::Ack`]
    Ack,
    /// [`TransportEvent::Error`]
    Error,
}

/// Something observable happened on the relay link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Status changed
    Status(TransportStatus),
    /// Link opened
    Connected,
    /// Link closed
    Disconnected {
        /// Close code reported by the link, if any
        code: Option<u32>,
    },
    /// Envelope delivered by the relay (already acknowledged)
    Envelope(Envelope),
    /// The relay accepted one of our data frames
    Ack {
        /// Client message id of the data frame
        message_id: String,
    },
    /// Non-fatal error report
    Error(String),
}

impl TransportEvent {
    /// Category of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Status(_) => EventKind::Status,
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Envelope(_) => EventKind::Envelope,
            Self::Ack { .. } => EventKind::Ack,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// Token returned by [`EventBus::subscribe`]. Pass it to
/// [`EventBus::unsubscribe`] to remove exactly that handler.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "dropping the token makes the subscription permanent"]
pub struct Subscription {
    id: u64,
}

type Handler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    list: Vec<Subscriber>,
}

/// Ordered publish/subscribe list for [`TransportEvent`]s.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` for every event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.add(Some(kind), Arc::new(handler))
    }

    /// Call `handler` for every event.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    /// Remove the handler registered under `subscription`.
    ///
    /// Returns false if it was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.list.len();
        subscribers.list.retain(|s| s.id != subscription.id);
        subscribers.list.len() != before
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.lock().list.len()
    }

    /// True if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every matching handler, in subscription order.
    ///
    /// Handlers are called outside the subscriber lock, so a handler may
    /// subscribe or unsubscribe without deadlocking. Such changes take effect
    /// from the next event.
    pub fn emit(&self, event: &TransportEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .lock()
            .list
            .iter()
            .filter(|s| s.kind.is_none_or(|k| k == kind))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    fn add(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let mut subscribers = self.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.list.push(Subscriber { id, kind, handler });
        Subscription { id }
    }

    #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.inner.lock().expect("event bus lock poisoned")
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("subscribers", &self.len()).finish()
    }
}
