use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use tether_lifecycle::{AbortSignal, Closing, Lifecycle, delay};
use tether_types::{AbortReason, ConnectionError, Error, Payload, ReadyState};

use crate::config::{ListenOptions, SendOptions};
use crate::transport::{EventKind, Transport, TransportEvent};

/// Resolves once a sent message has left the transport's buffer.
pub type Sending = BoxFuture<'static, Result<(), Error>>;

/// A message connection with structured cancellation.
///
/// Cloning yields another handle to the same connection. The socket closes
/// when [`close`](Self::close) is called, when the transport closes or errors,
/// or when the last handle is dropped.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    transport: Arc<dyn Transport>,
    lifecycle: Lifecycle,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        if !self.lifecycle.is_closed() {
            tracing::debug!(url = self.transport.url(), "Socket dropped while open");
            drop(self.lifecycle.close(None));
        }
    }
}

impl Socket {
    /// Wrap a transport that has already opened.
    ///
    /// From here on, a close or error event on the transport closes the socket,
    /// and closing the socket closes the transport.
    ///
    /// # Errors
    ///
    /// [`Error::Construction`] if the transport is not [`ReadyState::Open`].
    pub fn from_transport(transport: Arc<dyn Transport>) -> Result<Self, Error> {
        let state = transport.ready_state();
        if state != ReadyState::Open {
            return Err(Error::Construction(state));
        }

        let lifecycle = Lifecycle::new(transport.url());
        bridge_transport_events(&transport, &lifecycle);

        let target = Arc::clone(&transport);
        lifecycle.add_teardown(move |reason| async move {
            close_transport(target.as_ref(), reason.as_ref());
            Ok(())
        })?;

        tracing::debug!(
            url = transport.url(),
            protocol = ?transport.protocol(),
            "Socket open"
        );
        Ok(Self {
            inner: Arc::new(SocketInner {
                transport,
                lifecycle,
            }),
        })
    }

    /// Aborts when the socket starts closing, with the close reason.
    #[must_use]
    pub fn signal(&self) -> &AbortSignal {
        self.inner.lifecycle.signal()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.is_closed()
    }

    /// The reason passed to the first close, once closing has started.
    ///
    /// `None` both while open and after a graceful close without a reason;
    /// check [`is_closed`](Self::is_closed) to tell them apart.
    #[must_use]
    pub fn close_reason(&self) -> Option<AbortReason> {
        self.inner.lifecycle.close_reason()
    }

    /// Resolve with the close reason once the socket starts closing.
    pub async fn closed(&self) -> Option<AbortReason> {
        self.inner.lifecycle.closed().await
    }

    /// Close the socket. Idempotent: later calls join the first close.
    ///
    /// A [`AbortReason::Connection`] reason closes the transport with its code
    /// and text.
    pub fn close(&self, reason: Option<AbortReason>) -> Closing {
        self.inner.lifecycle.close(reason)
    }

    /// Send one message.
    ///
    /// The message is handed to the transport before this returns. The future
    /// resolves once the transport's buffer has drained, checking once per
    /// scheduler turn, and rejects if the socket closes or `options.signal`
    /// aborts first. If the buffer is found empty at the moment of
    /// cancellation, the send still counts as delivered.
    pub fn send(&self, payload: impl Into<Payload>, options: SendOptions) -> Sending {
        if let Err(err) = self.inner.lifecycle.ensure_open() {
            return future::ready(Err(err)).boxed();
        }
        if let Err(err) = self.inner.transport.send(payload.into()) {
            return future::ready(Err(err)).boxed();
        }

        let transport = Arc::clone(&self.inner.transport);
        self.inner
            .lifecycle
            .run_task(options.signal.as_ref(), move |signal| async move {
                drain(transport.as_ref(), &signal).await
            })
            .boxed()
    }

    /// Call `callback` for every inbound message until the socket closes or
    /// `options.signal` aborts.
    ///
    /// An already-aborted signal makes this a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] if the socket has started closing.
    pub fn listen<F>(&self, callback: F, options: ListenOptions) -> Result<(), Error>
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        if options.signal.as_ref().is_some_and(AbortSignal::is_aborted) {
            return Ok(());
        }
        self.inner.lifecycle.ensure_open()?;

        let scope = match &options.signal {
            Some(signal) => AbortSignal::any([self.signal(), signal]),
            None => self.signal().clone(),
        };
        let id = self.inner.transport.add_listener(
            EventKind::Message,
            Box::new(move |event| {
                if let TransportEvent::Message(payload) = event {
                    callback(payload);
                }
            }),
        );
        let transport = Arc::clone(&self.inner.transport);
        scope.on_abort(move |_| {
            transport.remove_listener(id);
        });
        Ok(())
    }

    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.inner.transport.ready_state()
    }

    #[must_use]
    pub fn url(&self) -> &str {
        self.inner.transport.url()
    }

    /// The sub-protocol the server selected, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.inner.transport.protocol()
    }

    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.inner.transport.buffered_amount()
    }

    /// Sends still waiting for the buffer to drain.
    #[must_use]
    pub fn pending_sends(&self) -> usize {
        self.inner.lifecycle.pending_tasks()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("url", &self.url())
            .field("ready_state", &self.ready_state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Close the socket on transport close or error, and stop listening once the
/// socket is closing.
fn bridge_transport_events(transport: &Arc<dyn Transport>, lifecycle: &Lifecycle) {
    let on_close = {
        let lifecycle = lifecycle.clone();
        transport.add_listener(
            EventKind::Close,
            Box::new(move |event| {
                if let TransportEvent::Close(event) = event {
                    let reason = ConnectionError::from_close_event(event);
                    drop(lifecycle.close(Some(reason.into())));
                }
            }),
        )
    };
    let on_error = {
        let lifecycle = lifecycle.clone();
        transport.add_listener(
            EventKind::Error,
            Box::new(move |event| {
                if let TransportEvent::Error(message) = event {
                    tracing::debug!(error = %message, "Transport error");
                }
                drop(lifecycle.close(Some(ConnectionError::generic().into())));
            }),
        )
    };

    let transport = Arc::clone(transport);
    lifecycle.signal().on_abort(move |_| {
        transport.remove_listener(on_close);
        transport.remove_listener(on_error);
    });
}

fn close_transport(transport: &dyn Transport, reason: Option<&AbortReason>) {
    let state = transport.ready_state();
    if !state.is_live() {
        tracing::trace!(%state, "Transport already closing");
        return;
    }
    match reason.and_then(AbortReason::as_connection) {
        Some(err) => transport.close(err.code(), err.reason()),
        None => transport.close(None, None),
    }
}

async fn drain(transport: &dyn Transport, signal: &AbortSignal) -> Result<(), Error> {
    while transport.buffered_amount() > 0 {
        if let Err(reason) = delay(Duration::ZERO, Some(signal)).await {
            if transport.buffered_amount() == 0 {
                return Ok(());
            }
            return Err(reason.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CloseCall, MockTransport};
    use std::sync::Mutex;
    use tether_lifecycle::AbortController;
    use tether_types::CloseEvent;

    fn socket() -> (Arc<MockTransport>, Socket) {
        let transport = Arc::new(MockTransport::open().with_protocol("chat"));
        let socket = Socket::from_transport(transport.clone()).unwrap();
        (transport, socket)
    }

    fn collector() -> (
        Arc<Mutex<Vec<Payload>>>,
        impl Fn(&Payload) + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |payload: &Payload| {
            sink.lock().unwrap().push(payload.clone());
        })
    }

    #[tokio::test]
    async fn wrapping_requires_open_transport() {
        for state in [
            ReadyState::Connecting,
            ReadyState::Closing,
            ReadyState::Closed,
        ] {
            let transport = Arc::new(MockTransport::new(state));
            let err = Socket::from_transport(transport.clone()).unwrap_err();
            assert!(matches!(err, Error::Construction(s) if s == state));
            assert_eq!(transport.listener_count(), 0);
        }
    }

    #[tokio::test]
    async fn exposes_transport_details() {
        let (_transport, socket) = socket();
        assert_eq!(socket.url(), "ws://mock.test/");
        assert_eq!(socket.protocol(), Some("chat"));
        assert_eq!(socket.ready_state(), ReadyState::Open);
        assert!(!socket.signal().is_aborted());
    }

    #[tokio::test]
    async fn send_resolves_once_buffer_drains() {
        let (transport, socket) = socket();
        transport.script_buffered([5, 5, 0]);

        socket.send("hello", SendOptions::default()).await.unwrap();

        assert_eq!(transport.sent(), vec![Payload::from("hello")]);
        assert_eq!(socket.pending_sends(), 0);
    }

    #[tokio::test]
    async fn send_hands_payload_over_before_polling() {
        let (transport, socket) = socket();
        let sending = socket.send(vec![1_u8, 2, 3], SendOptions::default());

        assert_eq!(transport.sent(), vec![Payload::Binary(vec![1, 2, 3])]);
        assert_eq!(socket.pending_sends(), 1);
        sending.await.unwrap();
    }

    #[tokio::test]
    async fn sends_commit_in_call_order() {
        let (transport, socket) = socket();
        transport.set_buffered(4);

        let first = socket.send("a", SendOptions::default());
        let second = socket.send("b", SendOptions::default());
        assert_eq!(transport.sent(), vec![Payload::from("a"), Payload::from("b")]);

        transport.set_buffered(0);
        second.await.unwrap();
        first.await.unwrap();
        assert_eq!(transport.sent(), vec![Payload::from("a"), Payload::from("b")]);
    }

    #[tokio::test]
    async fn completed_sends_leave_no_signal_listeners() {
        let (_transport, socket) = socket();
        let app = AbortController::new();
        let close_baseline = socket.signal().listener_count();

        for i in 0..100 {
            socket
                .send(
                    format!("m{i}"),
                    SendOptions::with_signal(app.signal().clone()),
                )
                .await
                .unwrap();
        }

        assert_eq!(socket.signal().listener_count(), close_baseline);
        assert_eq!(app.signal().listener_count(), 0);
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (transport, socket) = socket();
        socket.close(None).await.unwrap();

        let err = socket.send("late", SendOptions::default()).await.unwrap_err();

        assert!(err.is_closed());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn send_with_aborted_signal_rejects_while_buffered() {
        let (transport, socket) = socket();
        transport.set_buffered(10);

        let err = socket
            .send(
                "hello",
                SendOptions::with_signal(AbortSignal::aborted(AbortReason::TimedOut)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Aborted(AbortReason::TimedOut)));
        assert_eq!(transport.sent().len(), 1);
        assert!(!socket.is_closed());
    }

    #[tokio::test]
    async fn send_counts_as_delivered_when_drained_at_cancellation() {
        let (transport, socket) = socket();
        // The loop check sees 10; the re-check after cancellation sees 0.
        transport.script_buffered([10, 0]);

        socket
            .send(
                "hello",
                SendOptions::with_signal(AbortSignal::aborted(AbortReason::Aborted)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn close_rejects_pending_sends() {
        let (transport, socket) = socket();
        transport.set_buffered(10);
        let sending = socket.send("stuck", SendOptions::default());

        let reason = AbortReason::custom("shutting down");
        socket.close(Some(reason)).await.unwrap();

        let err = sending.await.unwrap_err();
        assert!(matches!(err, Error::Aborted(AbortReason::Custom(_))));
    }

    #[tokio::test]
    async fn close_closes_transport_once() {
        let (transport, socket) = socket();

        let first = socket.close(None);
        let second = socket.close(Some(AbortReason::TimedOut));
        assert!(socket.signal().is_aborted());
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(
            transport.close_calls(),
            vec![CloseCall {
                code: None,
                reason: None
            }]
        );
        assert!(socket.close_reason().is_none());
        assert!(socket.is_closed());
    }

    #[tokio::test]
    async fn connection_reason_is_forwarded_to_transport() {
        let (transport, socket) = socket();
        let reason = ConnectionError::new(Some(4001), Some("going away".to_owned()));

        socket.close(Some(reason.into())).await.unwrap();

        assert_eq!(
            transport.close_calls(),
            vec![CloseCall {
                code: Some(4001),
                reason: Some("going away".to_owned())
            }]
        );
    }

    #[tokio::test]
    async fn transport_close_event_closes_socket() {
        let (transport, socket) = socket();

        transport.finish_close(CloseEvent::new(4000, "server done", true));

        assert!(socket.is_closed());
        let reason = socket.closed().await.unwrap();
        let err = reason.as_connection().unwrap();
        assert_eq!(err.code(), Some(4000));
        assert_eq!(err.reason(), Some("server done"));
        // Already closed; no second close handshake.
        socket.close(None).await.unwrap();
        assert!(transport.close_calls().is_empty());
        assert_eq!(transport.listener_count(), 0);
    }

    #[tokio::test]
    async fn transport_error_closes_socket_with_generic_error() {
        let (transport, socket) = socket();

        transport.emit(TransportEvent::Error("reset".to_owned()));

        let reason = socket.close_reason().unwrap();
        assert_eq!(reason.as_connection(), Some(&ConnectionError::generic()));
        socket.close(None).await.unwrap();
        assert_eq!(
            transport.close_calls(),
            vec![CloseCall {
                code: None,
                reason: None
            }]
        );
    }

    #[tokio::test]
    async fn listen_delivers_until_close() {
        let (transport, socket) = socket();
        let (seen, callback) = collector();
        socket.listen(callback, ListenOptions::default()).unwrap();

        transport.emit(TransportEvent::Message(Payload::from("one")));
        socket.close(None).await.unwrap();
        transport.emit(TransportEvent::Message(Payload::from("two")));

        assert_eq!(*seen.lock().unwrap(), vec![Payload::from("one")]);
        assert_eq!(transport.listener_count(), 0);
    }

    #[tokio::test]
    async fn listen_stops_when_its_signal_aborts() {
        let (transport, socket) = socket();
        let controller = AbortController::new();
        let (seen, callback) = collector();
        socket
            .listen(callback, ListenOptions::with_signal(controller.signal().clone()))
            .unwrap();

        transport.emit(TransportEvent::Message(Payload::from("one")));
        controller.abort(AbortReason::Aborted);
        transport.emit(TransportEvent::Message(Payload::from("two")));

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!socket.is_closed());
        // The merged scope detached from the socket's close signal.
        assert_eq!(socket.signal().listener_count(), 1);
    }

    #[tokio::test]
    async fn listen_with_aborted_signal_is_a_no_op() {
        let (transport, socket) = socket();
        let before = transport.listener_count();

        socket
            .listen(
                |_| panic!("must not be called"),
                ListenOptions::with_signal(AbortSignal::aborted(AbortReason::Aborted)),
            )
            .unwrap();

        assert_eq!(transport.listener_count(), before);
    }

    #[tokio::test]
    async fn listen_after_close_fails() {
        let (_transport, socket) = socket();
        socket.close(None).await.unwrap();

        let err = socket
            .listen(|_| {}, ListenOptions::default())
            .unwrap_err();

        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn dropping_last_handle_closes_transport() {
        let (transport, socket) = socket();
        let copy = socket.clone();
        drop(socket);
        assert!(transport.close_calls().is_empty());

        drop(copy);
        tokio::task::yield_now().await;

        assert_eq!(transport.close_calls().len(), 1);
        assert_eq!(transport.listener_count(), 0);
    }
}
