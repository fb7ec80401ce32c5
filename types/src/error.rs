use thiserror::Error;

use crate::{AbortReason, ConnectionError, ReadyState};

/// Errors surfaced by sockets, their transports, and the lifecycle they run in.
///
/// `Clone` so that one shared close outcome can be handed to every caller.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A resource was built around a transport that is not open.
    #[error("transport must be open to be wrapped, but it is {0}")]
    Construction(ReadyState),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Cancelled by a caller signal or by the resource closing.
    #[error("operation aborted: {0}")]
    Aborted(AbortReason),
    /// A guarded operation was attempted after the resource closed.
    #[error("resource is closed")]
    Closed,
    /// The transport refused an operation in its current state.
    #[error("transport is {0}")]
    NotOpen(ReadyState),
    /// Malformed endpoint address or sub-protocol list.
    #[error("invalid socket argument: {0}")]
    Syntax(String),
}

impl Error {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// Rejecting with a signal's reason: connection failures keep their own
/// variant, anything else is an abort.
impl From<AbortReason> for Error {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Connection(err) => Self::Connection(err),
            other => Self::Aborted(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_reason_maps_to_connection_error() {
        let err = Error::from(AbortReason::Connection(ConnectionError::generic()));
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn other_reasons_map_to_aborted() {
        assert!(Error::from(AbortReason::TimedOut).is_aborted());
        assert!(Error::from(AbortReason::custom("stop")).is_aborted());
        assert_eq!(
            Error::from(AbortReason::TimedOut).to_string(),
            "operation aborted: timed out"
        );
    }

    #[test]
    fn construction_error_names_the_state() {
        let err = Error::Construction(ReadyState::Connecting);
        assert_eq!(
            err.to_string(),
            "transport must be open to be wrapped, but it is connecting"
        );
    }
}
