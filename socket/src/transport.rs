//! The transport primitive a [`Socket`](crate::Socket) wraps.
//!
//! A transport is a full-duplex message connection with a browser-style
//! surface: a [`ReadyState`], callback listeners per [`EventKind`], a
//! synchronous `send` that queues, and a `buffered_amount` counting the bytes
//! queued but not yet flushed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tether_types::{CloseEvent, Error, Payload, ReadyState};

/// Which events a listener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Message,
    Error,
    Close,
}

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The handshake completed; the transport is now [`ReadyState::Open`].
    Open,
    /// One inbound message, exactly as decoded.
    Message(Payload),
    /// The connection failed. The text is diagnostic only.
    Error(String),
    /// The connection is closed; always the last event.
    Close(CloseEvent),
}

impl TransportEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Message(_) => EventKind::Message,
            Self::Error(_) => EventKind::Error,
            Self::Close(_) => EventKind::Close,
        }
    }
}

/// Identifies a registered listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Box<dyn Fn(&TransportEvent) + Send + Sync>;

/// A full-duplex message connection.
///
/// Implementations emit events from a single task at a time, in order, and must
/// not hold internal locks while invoking listeners.
pub trait Transport: Send + Sync + 'static {
    /// The endpoint this transport connects to.
    fn url(&self) -> &str;

    fn ready_state(&self) -> ReadyState;

    /// Bytes handed to [`send`](Self::send) that have not been flushed yet.
    fn buffered_amount(&self) -> usize;

    /// The sub-protocol selected by the server, once open.
    fn protocol(&self) -> Option<&str>;

    /// Queue one message. Only valid while [`ReadyState::Open`].
    fn send(&self, payload: Payload) -> Result<(), Error>;

    /// Start the closing handshake. A no-op unless connecting or open.
    fn close(&self, code: Option<u16>, reason: Option<&str>);

    fn add_listener(&self, kind: EventKind, listener: Listener) -> ListenerId;

    /// Returns `false` if `id` was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

type SharedListener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

struct Entry {
    id: ListenerId,
    kind: EventKind,
    listener: SharedListener,
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Listener registry for [`Transport`] implementations.
///
/// [`emit`](Self::emit) calls listeners outside the registry lock, so they may
/// add or remove listeners, including themselves. A listener removed while an
/// event is being delivered is not called for it.
#[derive(Default)]
pub struct EventListeners {
    table: Mutex<ListenerTable>,
}

impl EventListeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, ListenerTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let mut table = self.table();
        let id = ListenerId(table.next_id);
        table.next_id += 1;
        table.entries.push(Entry {
            id,
            kind,
            listener: Arc::from(listener),
        });
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut table = self.table();
        let before = table.entries.len();
        table.entries.retain(|entry| entry.id != id);
        table.entries.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener registered for its kind, in
    /// registration order.
    pub fn emit(&self, event: &TransportEvent) {
        let kind = event.kind();
        let snapshot: Vec<(ListenerId, SharedListener)> = self
            .table()
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| (entry.id, Arc::clone(&entry.listener)))
            .collect();

        for (id, listener) in snapshot {
            let registered = self.table().entries.iter().any(|entry| entry.id == id);
            if registered {
                listener(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_only_matching_kind() {
        let listeners = EventListeners::new();
        let opens = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&opens);
        listeners.add(
            EventKind::Open,
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        );

        listeners.emit(&TransportEvent::Message(Payload::from("x")));
        listeners.emit(&TransportEvent::Open);

        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let listeners = EventListeners::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&calls);
        let id = listeners.add(
            EventKind::Open,
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.emit(&TransportEvent::Open);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(listeners.is_empty());
    }

    #[test]
    fn listener_removed_mid_emit_is_skipped() {
        let listeners = Arc::new(EventListeners::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let second_id = Arc::new(Mutex::new(None::<ListenerId>));
        let registry = Arc::clone(&listeners);
        let target = Arc::clone(&second_id);
        listeners.add(
            EventKind::Open,
            Box::new(move |_| {
                if let Some(id) = *target.lock().unwrap() {
                    registry.remove(id);
                }
            }),
        );
        let hits = Arc::clone(&calls);
        let id = listeners.add(
            EventKind::Open,
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        );
        *second_id.lock().unwrap() = Some(id);

        listeners.emit(&TransportEvent::Open);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(listeners.len(), 1);
    }
}
