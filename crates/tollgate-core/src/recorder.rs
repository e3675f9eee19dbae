//! Step recorder: turns an adjudicated step into one atomic store write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_state::{
    Content, Disposition, PolicyMode, Role, Stage, Step, TrajectoryHeader, TrajectoryStore,
};

use crate::error::HarnessResult;
use crate::lifecycle::TrajectoryStateMachine;
use crate::obs;

/// Caller-supplied part of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub stage: Stage,
    pub role: Role,
    pub content: Content,
    #[serde(default)]
    pub snapshot: Option<serde_json::Value>,
}

impl StepInput {
    pub fn new(stage: Stage, role: Role, content: Content) -> Self {
        Self {
            stage,
            role,
            content,
            snapshot: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot: serde_json::Value) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

/// Appends steps under the state machine's rules.
///
/// The sequence number is `header.step_count + 1` and the step is written
/// together with the advanced header by a single `append_step`, so a
/// failed or cancelled write leaves no step and consumes no number. The
/// caller must hold the trajectory's writer guard.
pub struct StepRecorder {
    store: Arc<dyn TrajectoryStore>,
    machine: TrajectoryStateMachine,
}

impl StepRecorder {
    pub fn new(store: Arc<dyn TrajectoryStore>, machine: TrajectoryStateMachine) -> Self {
        Self { store, machine }
    }

    /// Sequence number the next step on `header` will get.
    pub fn next_seq(header: &TrajectoryHeader) -> u64 {
        header.step_count + 1
    }

    /// Record `input` with its disposition. Returns the committed header
    /// and step.
    pub async fn record(
        &self,
        header: &TrajectoryHeader,
        input: StepInput,
        mode: PolicyMode,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> HarnessResult<(TrajectoryHeader, Step)> {
        let next = self.machine.step_appended(header, now)?;
        let step = Step {
            seq: next.step_count,
            stage: input.stage,
            role: input.role,
            content: input.content,
            created_at: now,
            snapshot: input.snapshot,
            mode,
            disposition: Some(disposition),
        };

        if let Err(e) = self.store.append_step(&next, &step).await {
            obs::emit_storage_error(header.id.as_str(), "append_step", &e);
            return Err(e.into());
        }
        Ok((next, step))
    }
}
