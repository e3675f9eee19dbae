//! Error types for tollgate-state

use thiserror::Error;

use crate::model::TrajectoryStatus;

/// Errors raised while connecting to or preparing a backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors surfaced by [`crate::TrajectoryStore`] implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("trajectory not found: {trajectory_id}")]
    TrajectoryNotFound { trajectory_id: String },

    #[error("agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("trajectory {trajectory_id} already exists")]
    DuplicateTrajectory { trajectory_id: String },

    #[error("trajectory {trajectory_id} is {status}, expected {expected}")]
    InvalidTrajectoryState {
        trajectory_id: String,
        status: TrajectoryStatus,
        expected: String,
    },

    /// The stored step count moved underneath the writer.
    #[error("sequence conflict on {trajectory_id}: expected seq {expected}, got {actual}")]
    SequenceConflict {
        trajectory_id: String,
        expected: u64,
        actual: u64,
    },

    /// The stored status moved underneath the writer.
    #[error("status conflict on {trajectory_id}: stored {stored}, writer expected {expected}")]
    StatusConflict {
        trajectory_id: String,
        stored: String,
        expected: String,
    },

    /// The header was rewritten since the writer read it.
    #[error("revision conflict on {trajectory_id}: expected revision {expected}, got {actual}")]
    RevisionConflict {
        trajectory_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid page token: {reason}")]
    InvalidPageToken { reason: String },

    /// The backend does not retain step history.
    #[error("history unavailable: {backend} does not retain trajectory history")]
    HistoryUnavailable { backend: String },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_conflict_display() {
        let err = StorageError::SequenceConflict {
            trajectory_id: "traj-1".into(),
            expected: 4,
            actual: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("traj-1"));
        assert!(msg.contains("expected seq 4"));
    }

    #[test]
    fn test_history_unavailable_display() {
        let err = StorageError::HistoryUnavailable {
            backend: "ephemeral".into(),
        };
        assert!(err.to_string().contains("history unavailable"));
    }
}
