//! Public types for the record-sync facade.

use thiserror::Error;

use crate::config::ConfigError;
use crate::record::RecordKind;
use crate::storage::traits::StoreError;

/// Facade lifecycle state.
///
/// ```text
/// Created → Running → ShuttingDown → Stopped
/// ```
///
/// CRUD calls work in every state; `start()` only launches the background
/// reaper, and `shutdown()` stops it together with every subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, background tasks not started
    Created,
    /// Reaper running
    Running,
    /// Stopping subscriptions and the reaper
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Errors surfaced by [`RecordSync`](super::RecordSync).
///
/// Transport failures on CRUD calls never show up here: they are absorbed by
/// the local fallback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A remote provider could not be reached where no fallback applies
    #[error("remote provider unavailable: {0}")]
    RemoteUnavailable(String),
    /// The provider refused the payload
    #[error("rejected: {0}")]
    ValidationRejected(String),
    #[error("{kind} '{id}' not found")]
    NotFound { kind: RecordKind, id: String },
    /// Remote and local storage both failed; the write is lost
    #[error("all providers exhausted: {0}")]
    AllProvidersExhausted(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Map a caller-facing adapter error. Anything else means the local
    /// store failed too.
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::Rejected(msg) => Self::ValidationRejected(msg),
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            other => Self::AllProvidersExhausted(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Running), "Running");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
        assert_eq!(format!("{}", EngineState::Stopped), "Stopped");
    }

    #[test]
    fn test_store_error_mapping() {
        assert_eq!(
            SyncError::from_store(StoreError::Rejected("too big".into())),
            SyncError::ValidationRejected("too big".into())
        );
        assert_eq!(
            SyncError::from_store(StoreError::NotFound {
                kind: RecordKind::Comment,
                id: "c1".into()
            }),
            SyncError::NotFound {
                kind: RecordKind::Comment,
                id: "c1".into()
            }
        );
        assert!(matches!(
            SyncError::from_store(StoreError::Backend("disk full".into())),
            SyncError::AllProvidersExhausted(_)
        ));
    }
}
