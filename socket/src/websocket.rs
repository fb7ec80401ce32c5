//! [`Transport`] over a tokio-tungstenite WebSocket client.
//!
//! `connect` validates its arguments synchronously and spawns a driver task
//! that owns the stream. The handle talks to the driver over an unbounded
//! command channel, so `send` never blocks; the bytes it queues are reported
//! by `buffered_amount` until the driver has written them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tether_types::{
    CLOSE_NO_STATUS, CLOSE_NORMAL, CloseEvent, Error, Payload, ReadyState, is_sendable_close_code,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::transport::{EventKind, EventListeners, Listener, ListenerId, Transport, TransportEvent};

/// Close reasons are limited to 123 bytes so the frame fits a control frame.
const MAX_CLOSE_REASON: usize = 123;

/// How long the closing handshake may take before the connection is dropped.
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Send(Payload),
    Close { code: Option<u16>, reason: String },
}

struct Shared {
    url: String,
    state: Mutex<ReadyState>,
    buffered: AtomicUsize,
    protocol: OnceLock<String>,
    listeners: EventListeners,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ReadyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        let mut state = self.state();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn ready_state_is(&self, state: ReadyState) -> bool {
        *self.state() == state
    }

    fn finish(&self, event: CloseEvent) {
        *self.state() = ReadyState::Closed;
        tracing::debug!(
            url = %self.url,
            code = event.code(),
            clean = event.was_clean(),
            "WebSocket closed"
        );
        self.listeners.emit(&TransportEvent::Close(event));
    }

    fn fail(&self, message: String) {
        *self.state() = ReadyState::Closed;
        tracing::debug!(url = %self.url, error = %message, "WebSocket failed");
        self.listeners.emit(&TransportEvent::Error(message));
        self.listeners.emit(&TransportEvent::Close(CloseEvent::abnormal()));
    }
}

/// A WebSocket client connection.
pub struct WebSocket {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl WebSocket {
    /// Begin connecting to `url`, offering `protocols` in order.
    ///
    /// Must be called inside a tokio runtime. The returned transport starts in
    /// [`ReadyState::Connecting`].
    ///
    /// # Errors
    ///
    /// [`Error::Syntax`] when the URL is not an absolute `ws`/`wss` URL without a
    /// fragment, or a protocol is empty, not a valid token, or repeated.
    pub fn connect(url: &str, protocols: &[String]) -> Result<Arc<Self>, Error> {
        let parsed = Url::parse(url).map_err(|e| Error::Syntax(format!("{url}: {e}")))?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::Syntax(format!(
                    "unsupported URL scheme '{other}', expected ws or wss"
                )));
            }
        }
        if parsed.fragment().is_some() {
            return Err(Error::Syntax(format!("{url}: fragments are not allowed")));
        }
        validate_protocols(protocols)?;

        let mut request = parsed
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Syntax(format!("{url}: {e}")))?;
        if !protocols.is_empty() {
            let offered = HeaderValue::from_str(&protocols.join(", "))
                .map_err(|e| Error::Syntax(format!("invalid protocol list: {e}")))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);
        }

        let shared = Arc::new(Shared {
            url: parsed.to_string(),
            state: Mutex::new(ReadyState::Connecting),
            buffered: AtomicUsize::new(0),
            protocol: OnceLock::new(),
            listeners: EventListeners::new(),
        });
        let (commands, receiver) = mpsc::unbounded_channel();

        tracing::debug!(url = %shared.url, ?protocols, "Connecting WebSocket");
        tokio::spawn(drive(Arc::clone(&shared), request, receiver));

        Ok(Arc::new(Self { shared, commands }))
    }

    /// Registered listeners across all event kinds.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }
}

impl Transport for WebSocket {
    fn url(&self) -> &str {
        &self.shared.url
    }

    fn ready_state(&self) -> ReadyState {
        *self.shared.state()
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    fn protocol(&self) -> Option<&str> {
        self.shared.protocol.get().map(String::as_str)
    }

    fn send(&self, payload: Payload) -> Result<(), Error> {
        let state = *self.shared.state();
        if state != ReadyState::Open {
            return Err(Error::NotOpen(state));
        }
        let len = payload.len();
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);
        if self.commands.send(Command::Send(payload)).is_err() {
            self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(Error::NotOpen(ReadyState::Closed));
        }
        Ok(())
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        {
            let mut state = self.shared.state();
            if !state.is_live() {
                return;
            }
            *state = ReadyState::Closing;
        }
        let code = code.map(|code| {
            if is_sendable_close_code(code) {
                code
            } else {
                tracing::warn!(code, "Close code cannot be sent; using {CLOSE_NORMAL}");
                CLOSE_NORMAL
            }
        });
        let reason = truncate_reason(reason.unwrap_or_default());
        let _ = self.commands.send(Command::Close {
            code,
            reason: reason.to_owned(),
        });
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) -> ListenerId {
        self.shared.listeners.add(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("url", &self.shared.url)
            .field("state", &self.ready_state())
            .field("buffered", &self.buffered_amount())
            .finish_non_exhaustive()
    }
}

async fn drive(
    shared: Arc<Shared>,
    request: Request,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let connect = tokio_tungstenite::connect_async(request);
    tokio::pin!(connect);

    let stream = loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::Close { .. }) | None => {
                    shared.fail("connection closed before it was established".to_owned());
                    return;
                }
                // `send` refuses until the transport is open.
                Some(Command::Send(_)) => {}
            },
            result = &mut connect => match result {
                Ok((stream, response)) => {
                    if let Some(protocol) = response
                        .headers()
                        .get(SEC_WEBSOCKET_PROTOCOL)
                        .and_then(|value| value.to_str().ok())
                    {
                        let _ = shared.protocol.set(protocol.to_owned());
                    }
                    break stream;
                }
                Err(err) => {
                    shared.fail(err.to_string());
                    return;
                }
            },
        }
    };

    if shared.transition(ReadyState::Connecting, ReadyState::Open) {
        tracing::debug!(url = %shared.url, protocol = ?shared.protocol.get(), "WebSocket open");
        shared.listeners.emit(&TransportEvent::Open);
    }

    let (mut sink, mut stream) = stream.split();
    let mut peer_close: Option<CloseEvent> = None;
    let mut failed = false;
    let mut handles_dropped = false;
    let mut closing = false;
    let close_wait = tokio::time::sleep(CLOSE_HANDSHAKE_TIMEOUT);
    tokio::pin!(close_wait);

    loop {
        if !closing && shared.ready_state_is(ReadyState::Closing) {
            closing = true;
            close_wait.as_mut().reset(Instant::now() + CLOSE_HANDSHAKE_TIMEOUT);
        }
        tokio::select! {
            () = &mut close_wait, if closing => {
                tracing::warn!(url = %shared.url, "Closing handshake timed out; dropping connection");
                failed = true;
                break;
            }
            command = commands.recv(), if !handles_dropped => match command {
                Some(Command::Send(payload)) => {
                    let len = payload.len();
                    let message = match payload {
                        Payload::Text(text) => Message::Text(text.into()),
                        Payload::Binary(bytes) => Message::Binary(bytes.into()),
                    };
                    let result = sink.send(message).await;
                    shared.buffered.fetch_sub(len, Ordering::AcqRel);
                    if let Err(err) = result {
                        tracing::warn!(url = %shared.url, "WebSocket write failed: {err}");
                        shared.listeners.emit(&TransportEvent::Error(err.to_string()));
                        failed = true;
                        break;
                    }
                }
                Some(Command::Close { code, reason }) => {
                    let frame = code.map(|code| CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    });
                    if let Err(err) = sink.send(Message::Close(frame)).await {
                        tracing::debug!(url = %shared.url, "Sending close frame failed: {err}");
                    }
                }
                None => {
                    handles_dropped = true;
                    shared.transition(ReadyState::Open, ReadyState::Closing);
                    if let Err(err) = sink.send(Message::Close(None)).await {
                        tracing::debug!(url = %shared.url, "Sending close frame failed: {err}");
                    }
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    tracing::trace!(url = %shared.url, len = text.len(), "Text message");
                    shared
                        .listeners
                        .emit(&TransportEvent::Message(Payload::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::trace!(url = %shared.url, len = data.len(), "Binary message");
                    shared
                        .listeners
                        .emit(&TransportEvent::Message(Payload::Binary(data.to_vec())));
                }
                Some(Ok(Message::Close(frame))) => {
                    shared.transition(ReadyState::Open, ReadyState::Closing);
                    peer_close = Some(match frame {
                        Some(frame) => {
                            CloseEvent::new(u16::from(frame.code), frame.reason.as_str(), true)
                        }
                        None => CloseEvent::new(CLOSE_NO_STATUS, "", true),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => break,
                Some(Err(err)) => {
                    tracing::debug!(url = %shared.url, "WebSocket read failed: {err}");
                    shared.listeners.emit(&TransportEvent::Error(err.to_string()));
                    failed = true;
                    break;
                }
            },
        }
    }

    let event = match peer_close {
        Some(event) if !failed => event,
        _ => CloseEvent::abnormal(),
    };
    shared.finish(event);
}

fn validate_protocols(protocols: &[String]) -> Result<(), Error> {
    let mut seen = HashSet::with_capacity(protocols.len());
    for protocol in protocols {
        if protocol.is_empty() {
            return Err(Error::Syntax("protocol names must not be empty".to_owned()));
        }
        if !protocol.bytes().all(is_token_byte) {
            return Err(Error::Syntax(format!(
                "protocol '{protocol}' is not a valid token"
            )));
        }
        if !seen.insert(protocol.as_str()) {
            return Err(Error::Syntax(format!("protocol '{protocol}' is repeated")));
        }
    }
    Ok(())
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    tracing::warn!(len = reason.len(), "Close reason truncated to {end} bytes");
    &reason[..end]
}
