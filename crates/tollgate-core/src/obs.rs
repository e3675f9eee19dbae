//! Structured observability hooks for trajectory lifecycle events.
//!
//! - `TrajectorySpan` RAII guard scoping work to one trajectory id
//! - `trajectory_span` for instrumenting async work
//! - `emit_*` functions, one per lifecycle event
//!
//! Events are emitted at `info!` (storage errors at `warn!`). Filter with
//! `TOLLGATE_LOG`; JSON output via `init_tracing(true, ..)`.

use tracing::info;

use tollgate_state::{Decision, PolicyMode, Stage, TrajectoryStatus};

/// RAII guard that enters a trajectory-scoped span.
///
/// ```ignore
/// let _span = TrajectorySpan::enter("traj-1234");
/// // everything logged here carries trajectory_id = "traj-1234"
/// ```
pub struct TrajectorySpan {
    _span: tracing::span::EnteredSpan,
}

impl TrajectorySpan {
    pub fn enter(trajectory_id: &str) -> Self {
        Self {
            _span: trajectory_span(trajectory_id).entered(),
        }
    }
}

/// Span for async work on one trajectory; attach with
/// `tracing::Instrument::instrument` so the future stays `Send`.
pub fn trajectory_span(trajectory_id: &str) -> tracing::Span {
    tracing::info_span!("tollgate.trajectory", trajectory_id = %trajectory_id)
}

/// Emit event: trajectory created for an agent.
pub fn emit_trajectory_initialized(trajectory_id: &str, agent_id: &str, mode: PolicyMode) {
    info!(
        event = "trajectory.initialized",
        trajectory_id = %trajectory_id,
        agent_id = %agent_id,
        mode = %mode,
    );
}

/// Emit event: a step was adjudicated and committed.
pub fn emit_step_adjudicated(
    trajectory_id: &str,
    seq: u64,
    stage: Stage,
    decision: Decision,
    mode: PolicyMode,
) {
    info!(
        event = "trajectory.step_adjudicated",
        trajectory_id = %trajectory_id,
        seq = seq,
        stage = %stage,
        decision = %decision,
        mode = %mode,
    );
}

pub fn emit_trajectory_suspended(trajectory_id: &str, step_count: u64) {
    info!(
        event = "trajectory.suspended",
        trajectory_id = %trajectory_id,
        step_count = step_count,
    );
}

/// Emit event: trajectory resumed. `from` is the status it was resumed from.
pub fn emit_trajectory_resumed(trajectory_id: &str, from: TrajectoryStatus, step_count: u64) {
    info!(
        event = "trajectory.resumed",
        trajectory_id = %trajectory_id,
        from = %from,
        step_count = step_count,
    );
}

pub fn emit_trajectory_finalized(
    trajectory_id: &str,
    status: TrajectoryStatus,
    step_count: u64,
    duration_seconds: Option<f64>,
) {
    info!(
        event = "trajectory.finalized",
        trajectory_id = %trajectory_id,
        status = %status,
        step_count = step_count,
        duration_seconds = duration_seconds.unwrap_or(0.0),
    );
}

/// Emit event: a store write failed (warning level).
pub fn emit_storage_error(trajectory_id: &str, operation: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(
        event = "trajectory.storage_error",
        trajectory_id = %trajectory_id,
        operation = %operation,
        error = %error,
    );
}
