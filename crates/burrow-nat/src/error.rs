//! Error taxonomy for connectivity establishment.
//!
//! Every stage of the cascade reports failures through [`TraversalError`].
//! Only `TimedOut` is retried (by callers, up to a bounded count); all other
//! kinds escalate immediately to the orchestrator, which advances to the next
//! strategy rather than failing the overall call.

use thiserror::Error;

/// Failure kinds surfaced by the traversal stages.
///
/// The variants are `Clone` so a terminal outcome can be memoized per target
/// and broadcast to coalesced callers; transport-level `std::io::Error`s are
/// therefore carried as strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraversalError {
    /// No reply arrived within the stage's window.
    #[error("timed out waiting for a reply")]
    TimedOut,

    /// Transport-level send failure (no route, socket closed). Never retried.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// Malformed or unexpected reply from the rendezvous or relay peer.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Candidate ports or relay capacity exhausted. Terminal for the stage.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Explicit caller cancellation. Always terminal.
    #[error("operation cancelled")]
    Cancelled,
}

impl TraversalError {
    /// Whether a caller-side bounded retry is appropriate for this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// Convert a transport-level I/O failure into its escalation kind.
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Self {
        Self::Unreachable(err.to_string())
    }
}

impl From<std::io::Error> for TraversalError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeout_is_retryable() {
        assert!(TraversalError::TimedOut.is_retryable());
        assert!(!TraversalError::Unreachable("x".into()).is_retryable());
        assert!(!TraversalError::ProtocolMismatch("x".into()).is_retryable());
        assert!(!TraversalError::ResourceExhausted("x".into()).is_retryable());
        assert!(!TraversalError::Cancelled.is_retryable());
    }

    #[test]
    fn test_io_error_maps_to_unreachable() {
        let io = std::io::Error::new(std::io::ErrorKind::HostUnreachable, "no route");
        let err: TraversalError = io.into();
        assert!(matches!(err, TraversalError::Unreachable(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            TraversalError::TimedOut.to_string(),
            "timed out waiting for a reply"
        );
        assert_eq!(
            TraversalError::Cancelled.to_string(),
            "operation cancelled"
        );
    }
}
