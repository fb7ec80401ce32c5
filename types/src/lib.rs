//! Core domain types for Tether.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Every other crate in the workspace speaks in these types: transports report a
//! [`ReadyState`] and emit [`CloseEvent`]s, signals carry an [`AbortReason`], and every
//! fallible operation returns [`Error`].

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod error;
mod reason;

pub use error::Error;
pub use reason::{AbortReason, ConnectionError};

use std::fmt;

// ============================================================================
// Ready state
// ============================================================================

/// Connection state of a transport primitive.
///
/// Transitions only move forward: `Connecting -> Open -> Closing -> Closed`,
/// with `Connecting -> Closed` when the handshake fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    /// Whether the connection can still be closed by us (`Connecting` or `Open`).
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Payload
// ============================================================================

/// One message worth of data, as handed to or decoded by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Size in bytes as counted by outbound buffering.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Self::Binary(value.to_vec())
    }
}

// ============================================================================
// Close event
// ============================================================================

/// Status code sent when a connection closes normally.
pub const CLOSE_NORMAL: u16 = 1000;

/// Reserved status code reported when a close frame carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Reserved status code reported when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Details reported by a transport when its connection has closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    code: u16,
    reason: String,
    was_clean: bool,
}

impl CloseEvent {
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>, was_clean: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean,
        }
    }

    /// A close without a closing handshake (network drop, failed handshake).
    #[must_use]
    pub fn abnormal() -> Self {
        Self::new(CLOSE_ABNORMAL, String::new(), false)
    }

    #[must_use]
    pub fn code(&self) -> u16 {
        self.code
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Whether both sides completed the closing handshake.
    #[must_use]
    pub fn was_clean(&self) -> bool {
        self.was_clean
    }
}

/// Whether `code` may be sent in a close frame by an application.
///
/// Only 1000 and the 3000-4999 range are allowed; the rest are reserved for the
/// protocol itself.
#[must_use]
pub fn is_sendable_close_code(code: u16) -> bool {
    code == CLOSE_NORMAL || (3000..=4999).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_state_liveness() {
        assert!(ReadyState::Connecting.is_live());
        assert!(ReadyState::Open.is_live());
        assert!(!ReadyState::Closing.is_live());
        assert!(!ReadyState::Closed.is_live());
    }

    #[test]
    fn payload_len_counts_utf8_bytes() {
        assert_eq!(Payload::from("héllo").len(), 6);
        assert_eq!(Payload::from(vec![1u8, 2, 3]).len(), 3);
        assert!(Payload::from("").is_empty());
    }

    #[test]
    fn payload_accessors() {
        let text = Payload::from("ping");
        assert_eq!(text.as_text(), Some("ping"));
        assert_eq!(text.as_bytes(), b"ping");

        let binary = Payload::from(&b"\x00\x01"[..]);
        assert_eq!(binary.as_text(), None);
        assert_eq!(binary.as_bytes(), &[0, 1]);
    }

    #[test]
    fn sendable_close_codes() {
        assert!(is_sendable_close_code(1000));
        assert!(is_sendable_close_code(3000));
        assert!(is_sendable_close_code(4999));
        assert!(!is_sendable_close_code(1001));
        assert!(!is_sendable_close_code(CLOSE_NO_STATUS));
        assert!(!is_sendable_close_code(CLOSE_ABNORMAL));
        assert!(!is_sendable_close_code(5000));
    }

    #[test]
    fn abnormal_close_event_is_unclean() {
        let event = CloseEvent::abnormal();
        assert_eq!(event.code(), CLOSE_ABNORMAL);
        assert_eq!(event.reason(), "");
        assert!(!event.was_clean());
    }
}
