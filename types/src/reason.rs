//! Why something stopped: connection failures and abort reasons.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::CloseEvent;

/// A failure of the underlying connection.
///
/// Carries the close status code and text when the failure was derived from a
/// close event; both are `None` for a bare transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    code: Option<u16>,
    reason: Option<String>,
}

impl ConnectionError {
    #[must_use]
    pub fn new(code: Option<u16>, reason: Option<String>) -> Self {
        Self { code, reason }
    }

    /// A transport error with no further detail.
    #[must_use]
    pub fn generic() -> Self {
        Self::new(None, None)
    }

    /// Derive the error from the close event a transport reported.
    ///
    /// An empty close text is treated as absent.
    #[must_use]
    pub fn from_close_event(event: &CloseEvent) -> Self {
        let reason = Some(event.reason())
            .filter(|reason| !reason.is_empty())
            .map(ToOwned::to_owned);
        Self::new(Some(event.code()), reason)
    }

    #[must_use]
    pub fn code(&self) -> Option<u16> {
        self.code
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.reason.as_deref()) {
            (Some(code), Some(reason)) => write!(f, "connection closed ({code}): {reason}"),
            (Some(code), None) => write!(f, "connection closed ({code})"),
            (None, Some(reason)) => write!(f, "connection error: {reason}"),
            (None, None) => f.write_str("connection error"),
        }
    }
}

impl StdError for ConnectionError {}

impl From<&CloseEvent> for ConnectionError {
    fn from(event: &CloseEvent) -> Self {
        Self::from_close_event(event)
    }
}

/// The reason carried by an aborted signal, and the reason a resource closed.
///
/// Cheap to clone: custom values are shared behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub enum AbortReason {
    /// Aborted without a specific reason.
    #[default]
    Aborted,
    /// A deadline elapsed.
    TimedOut,
    /// The underlying connection failed or was closed by the peer.
    Connection(ConnectionError),
    /// A caller-supplied value.
    Custom(Arc<dyn StdError + Send + Sync>),
}

impl AbortReason {
    /// Wrap an arbitrary caller value, e.g. `AbortReason::custom("shutting down")`.
    pub fn custom(reason: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Custom(Arc::from(reason.into()))
    }

    #[must_use]
    pub fn as_connection(&self) -> Option<&ConnectionError> {
        match self {
            Self::Connection(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => f.write_str("aborted"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Connection(err) => err.fmt(f),
            Self::Custom(err) => err.fmt(f),
        }
    }
}

impl From<ConnectionError> for AbortReason {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}
