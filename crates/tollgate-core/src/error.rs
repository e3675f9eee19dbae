//! Error types for the Tollgate harness.

use tollgate_state::{StorageError, TrajectoryStatus};

use crate::policy::{format_issues, PolicyError, PolicyIssue};

/// Every failure a harness caller can observe.
///
/// None of these is ever converted into a decision: callers choose their
/// own fail-open or fail-closed behavior.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("policy rejected: {}", format_issues(.0))]
    PolicySyntax(Vec<PolicyIssue>),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("trajectory not found: {trajectory_id}")]
    TrajectoryNotFound { trajectory_id: String },

    #[error("trajectory {trajectory_id} is already finalized ({status})")]
    TrajectoryFinalized {
        trajectory_id: String,
        status: TrajectoryStatus,
    },

    #[error("cannot append to finalized trajectory {trajectory_id} ({status})")]
    AppendAfterFinalize {
        trajectory_id: String,
        status: TrajectoryStatus,
    },

    #[error("agent {presented} cannot resume trajectory {trajectory_id} owned by {owner}")]
    ResumeMismatch {
        trajectory_id: String,
        owner: String,
        presented: String,
    },

    #[error("trajectory {trajectory_id} has another active writer")]
    WriterConflict { trajectory_id: String },

    #[error("policy evaluation timed out after {limit_ms}ms")]
    EvaluationTimeout { limit_ms: u64 },

    #[error("policy evaluation failed: {0}")]
    Evaluation(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("history unavailable: {backend} does not retain trajectory history")]
    HistoryUnavailable { backend: String },

    #[error("invalid transition for {trajectory_id}: cannot {operation} from {status}")]
    InvalidTransition {
        trajectory_id: String,
        status: TrajectoryStatus,
        operation: &'static str,
    },

    #[error("invalid agent: {0}")]
    InvalidAgent(String),
}

impl From<StorageError> for HarnessError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::TrajectoryNotFound { trajectory_id } => {
                HarnessError::TrajectoryNotFound { trajectory_id }
            }
            StorageError::HistoryUnavailable { backend } => {
                HarnessError::HistoryUnavailable { backend }
            }
            // Finalized by another session after this writer read the header.
            StorageError::InvalidTrajectoryState {
                trajectory_id,
                status,
                ..
            } if status.is_terminal() => HarnessError::AppendAfterFinalize {
                trajectory_id,
                status,
            },
            // Another process wrote first.
            StorageError::SequenceConflict { trajectory_id, .. }
            | StorageError::StatusConflict { trajectory_id, .. }
            | StorageError::RevisionConflict { trajectory_id, .. } => {
                HarnessError::WriterConflict { trajectory_id }
            }
            other => HarnessError::Storage(other),
        }
    }
}

impl From<PolicyError> for HarnessError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Syntax(issues) => HarnessError::PolicySyntax(issues),
            PolicyError::SchemaMismatch(message) => HarnessError::SchemaMismatch(message),
            PolicyError::Timeout { limit_ms } => HarnessError::EvaluationTimeout { limit_ms },
            PolicyError::Engine(message) => HarnessError::Evaluation(message),
        }
    }
}

/// Result type for harness operations.
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;
