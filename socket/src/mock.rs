//! In-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tether_types::{CloseEvent, Error, Payload, ReadyState};

use crate::transport::{EventKind, EventListeners, Listener, ListenerId, Transport, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CloseCall {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

/// Transport whose state and buffer are driven by the test.
///
/// `buffered_amount` pops from a scripted queue while it has entries and
/// repeats the last value afterwards.
pub(crate) struct MockTransport {
    url: String,
    protocol: Option<String>,
    state: Mutex<ReadyState>,
    buffered: Mutex<(VecDeque<usize>, usize)>,
    sent: Mutex<Vec<Payload>>,
    closes: Mutex<Vec<CloseCall>>,
    listeners: EventListeners,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    pub fn new(state: ReadyState) -> Self {
        Self {
            url: "ws://mock.test/".to_owned(),
            protocol: None,
            state: Mutex::new(state),
            buffered: Mutex::new((VecDeque::new(), 0)),
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            listeners: EventListeners::new(),
        }
    }

    pub fn open() -> Self {
        Self::new(ReadyState::Open)
    }

    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = Some(protocol.to_owned());
        self
    }

    pub fn set_state(&self, state: ReadyState) {
        *lock(&self.state) = state;
    }

    /// Values returned by successive `buffered_amount` calls.
    pub fn script_buffered(&self, values: impl IntoIterator<Item = usize>) {
        let mut buffered = lock(&self.buffered);
        buffered.0.extend(values);
    }

    pub fn set_buffered(&self, value: usize) {
        let mut buffered = lock(&self.buffered);
        buffered.0.clear();
        buffered.1 = value;
    }

    pub fn emit(&self, event: TransportEvent) {
        self.listeners.emit(&event);
    }

    /// Move to `Open` and announce it.
    pub fn finish_open(&self) {
        self.set_state(ReadyState::Open);
        self.emit(TransportEvent::Open);
    }

    /// Move to `Closed` and announce it.
    pub fn finish_close(&self, event: CloseEvent) {
        self.set_state(ReadyState::Closed);
        self.emit(TransportEvent::Close(event));
    }

    pub fn sent(&self) -> Vec<Payload> {
        lock(&self.sent).clone()
    }

    pub fn close_calls(&self) -> Vec<CloseCall> {
        lock(&self.closes).clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Transport for MockTransport {
    fn url(&self) -> &str {
        &self.url
    }

    fn ready_state(&self) -> ReadyState {
        *lock(&self.state)
    }

    fn buffered_amount(&self) -> usize {
        let mut buffered = lock(&self.buffered);
        if let Some(next) = buffered.0.pop_front() {
            buffered.1 = next;
        }
        buffered.1
    }

    fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    fn send(&self, payload: Payload) -> Result<(), Error> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(Error::NotOpen(state));
        }
        lock(&self.sent).push(payload);
        Ok(())
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        lock(&self.closes).push(CloseCall {
            code,
            reason: reason.map(str::to_owned),
        });
        let mut state = lock(&self.state);
        if state.is_live() {
            *state = ReadyState::Closing;
        }
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) -> ListenerId {
        self.listeners.add(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
