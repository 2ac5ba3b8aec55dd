//! Unified error handling for the run-tracker library.
//!
//! Location sources report failures with [`LocationError`]; everything the
//! tracker itself can refuse or lose is a [`TrackerError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::TrackerState;

/// Fatal failure reported by a location source.
///
/// A source never retries on its own. Once one of these is produced the
/// observation is over; re-requesting permissions and restarting is up to the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LocationError {
    /// The user or the platform revoked location permission
    #[error("location permission revoked")]
    PermissionRevoked,
    /// Location hardware or provider is not available
    #[error("location provider unavailable: {message}")]
    Unavailable { message: String },
    /// The source stream ended
    #[error("location source exhausted")]
    Exhausted,
}

/// Error type for tracker operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    /// The caller asked for a transition the current state does not allow
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: TrackerState,
    },
    /// The location source terminated abnormally
    #[error("location source failed: {0}")]
    SourceFailed(#[from] LocationError),
    /// The background worker died without handing the run back
    #[error("tracking worker failed: {message}")]
    WorkerFailed { message: String },
    /// Configuration error
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl TrackerError {
    pub(crate) fn invalid_transition(action: &'static str, state: TrackerState) -> Self {
        log::error!("[Tracker] Rejected '{}' in state {}", action, state);
        TrackerError::InvalidTransition { action, state }
    }
}

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackerError::InvalidTransition {
            action: "enable tracking",
            state: TrackerState::Idle,
        };
        assert_eq!(err.to_string(), "cannot enable tracking while idle");

        let err = TrackerError::from(LocationError::PermissionRevoked);
        assert!(err.to_string().contains("permission revoked"));
    }

    #[test]
    fn test_source_failure_conversion() {
        let err: TrackerError = LocationError::Exhausted.into();
        assert!(matches!(
            err,
            TrackerError::SourceFailed(LocationError::Exhausted)
        ));
    }
}
