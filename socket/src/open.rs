//! Opening a socket: race the transport's open, close, and error events
//! against an optional abort signal.

use std::sync::{Arc, Mutex, PoisonError};

use tether_lifecycle::{AbortRegistration, AbortSignal};
use tether_types::{AbortReason, CloseEvent, ConnectionError, Error, ReadyState};
use tokio::sync::oneshot;

use crate::config::OpenOptions;
use crate::resource::Socket;
use crate::transport::{EventKind, ListenerId, Transport, TransportEvent};
use crate::websocket::WebSocket;

enum Outcome {
    Opened,
    Closed(CloseEvent),
    Failed,
    Aborted(AbortReason),
}

/// Hands the first outcome to the waiting opener and ignores the rest.
struct Settle(Mutex<Option<oneshot::Sender<Outcome>>>);

impl Settle {
    fn settle(&self, outcome: Outcome) {
        let sender = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

/// Detaches every race subscription, however the race ends.
struct RaceGuard<'a> {
    transport: &'a dyn Transport,
    listeners: Vec<ListenerId>,
    abort: Option<AbortRegistration>,
}

impl Drop for RaceGuard<'_> {
    fn drop(&mut self) {
        for id in self.listeners.drain(..) {
            self.transport.remove_listener(id);
        }
        if let Some(registration) = self.abort.take() {
            registration.unregister();
        }
    }
}

impl Socket {
    /// Connect a WebSocket to `url` and wrap it once it opens.
    ///
    /// # Errors
    ///
    /// - [`Error::Syntax`] for an invalid URL or protocol list.
    /// - [`Error::Connection`] if the transport closes or fails before opening.
    /// - [`Error::Aborted`] if `options.signal` aborts first; the half-open
    ///   transport is closed.
    pub async fn open(url: &str, options: OpenOptions) -> Result<Self, Error> {
        let OpenOptions { protocols, signal } = options;
        Self::connect_with(
            || {
                let transport: Arc<dyn Transport> = WebSocket::connect(url, &protocols)?;
                Ok(transport)
            },
            signal.as_ref(),
        )
        .await
    }

    /// Open a socket over any transport. `connect` is only called if `signal`
    /// has not aborted yet.
    pub async fn connect_with<F>(connect: F, signal: Option<&AbortSignal>) -> Result<Self, Error>
    where
        F: FnOnce() -> Result<Arc<dyn Transport>, Error>,
    {
        if let Some(signal) = signal {
            signal.check()?;
        }
        let transport = connect()?;

        match establish(&transport, signal).await {
            Outcome::Opened => Self::from_transport(transport),
            Outcome::Closed(event) => {
                tracing::debug!(
                    url = transport.url(),
                    code = event.code(),
                    "Transport closed before opening"
                );
                Err(ConnectionError::from_close_event(&event).into())
            }
            Outcome::Failed => {
                tracing::debug!(url = transport.url(), "Transport failed before opening");
                Err(ConnectionError::generic().into())
            }
            Outcome::Aborted(reason) => {
                tracing::debug!(url = transport.url(), %reason, "Open aborted");
                transport.close(None, None);
                Err(reason.into())
            }
        }
    }
}

async fn establish(transport: &Arc<dyn Transport>, signal: Option<&AbortSignal>) -> Outcome {
    let (sender, receiver) = oneshot::channel();
    let settle = Arc::new(Settle(Mutex::new(Some(sender))));
    let mut guard = RaceGuard {
        transport: transport.as_ref(),
        listeners: Vec::with_capacity(3),
        abort: None,
    };

    for kind in [EventKind::Open, EventKind::Close, EventKind::Error] {
        let settle = Arc::clone(&settle);
        let id = transport.add_listener(
            kind,
            Box::new(move |event| {
                let outcome = match event {
                    TransportEvent::Open => Outcome::Opened,
                    TransportEvent::Close(event) => Outcome::Closed(event.clone()),
                    TransportEvent::Error(_) => Outcome::Failed,
                    TransportEvent::Message(_) => return,
                };
                settle.settle(outcome);
            }),
        );
        guard.listeners.push(id);
    }
    if let Some(signal) = signal {
        let settle = Arc::clone(&settle);
        guard.abort = Some(signal.on_abort(move |reason| {
            settle.settle(Outcome::Aborted(reason.clone()));
        }));
    }

    // The transport may have moved on before the listeners were in place.
    match transport.ready_state() {
        ReadyState::Connecting => {}
        ReadyState::Open => settle.settle(Outcome::Opened),
        ReadyState::Closing | ReadyState::Closed => settle.settle(Outcome::Failed),
    }

    let outcome = receiver.await.unwrap_or(Outcome::Failed);
    drop(guard);
    outcome
}
