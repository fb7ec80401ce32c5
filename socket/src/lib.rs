//! Message sockets with structured cancellation.
//!
//! A [`Socket`] wraps an open [`Transport`] (normally a [`WebSocket`]) and
//! gives it a single close path: closing the socket, a transport close or
//! error, and dropping the last handle all abort [`Socket::signal`], reject
//! pending sends, detach listeners, and close the transport once.
//!
//! ```no_run
//! # async fn demo() -> Result<(), tether_socket::Error> {
//! use tether_socket::{ListenOptions, OpenOptions, SendOptions, Socket};
//!
//! let socket = Socket::open("ws://localhost:9000", OpenOptions::new().protocol("chat")).await?;
//! socket.listen(|message| println!("{message:?}"), ListenOptions::default())?;
//! socket.send("ping", SendOptions::default()).await?;
//! socket.close(None).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod open;
mod resource;
pub mod transport;
mod websocket;

#[cfg(test)]
mod mock;

pub use config::{ConfigError, ListenOptions, OpenOptions, SendOptions, SocketConfig};
pub use resource::{Sending, Socket};
pub use transport::{EventKind, EventListeners, Listener, ListenerId, Transport, TransportEvent};
pub use websocket::{CLOSE_HANDSHAKE_TIMEOUT, WebSocket};

pub use tether_lifecycle::{AbortController, AbortSignal, Closing};
pub use tether_types::{
    AbortReason, CLOSE_NORMAL, CloseEvent, ConnectionError, Error, Payload, ReadyState,
};
