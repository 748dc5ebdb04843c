//! Error types for the tracking core.
//!
//! Every mutation returns [`Result`]. Only [`TrackerError::StaleEvent`] is
//! downgraded to a logged-and-dropped outcome by the
//! [`UsageMonitor`](crate::monitor::UsageMonitor); everything else reaches
//! the caller.

use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Negative or non-numeric token counts, malformed events. The operation
    /// had no effect.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The event predates the current window or the session's last event.
    #[error("stale event for session {session_id}: {timestamp} precedes {boundary}")]
    StaleEvent {
        session_id: String,
        timestamp: DateTime<Utc>,
        boundary: DateTime<Utc>,
    },

    #[error("session {0} has no recorded operations")]
    IncompleteSession(String),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Strategic compaction archives conversation history and must be
    /// confirmed by the caller.
    #[error("strategic compaction for session {0} requires confirmation")]
    ConfirmationRequired(String),

    /// A store write kept failing after all retries. In-memory state is left
    /// intact so a later attempt can succeed.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    PersistenceFailure {
        operation: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TrackerError {
    /// Whether this error is expected re-delivery noise that callers may log
    /// and drop.
    pub fn is_stale(&self) -> bool {
        matches!(self, TrackerError::StaleEvent { .. })
    }
}

/// Result alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_event_is_stale() {
        let now = Utc::now();
        let err = TrackerError::StaleEvent {
            session_id: "s1".into(),
            timestamp: now,
            boundary: now,
        };
        assert!(err.is_stale());
        assert!(!TrackerError::SessionClosed("s1".into()).is_stale());
    }

    #[test]
    fn persistence_failure_mentions_operation_and_attempts() {
        let err = TrackerError::PersistenceFailure {
            operation: "save handoff".into(),
            attempts: 4,
            source: std::io::Error::other("disk full"),
        };
        let msg = err.to_string();
        assert!(msg.contains("save handoff"));
        assert!(msg.contains("4 attempt(s)"));
        assert!(msg.contains("disk full"));
    }
}
