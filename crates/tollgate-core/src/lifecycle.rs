//! Trajectory state machine.
//!
//! ```text
//!            first append          finalize
//! Pending ──────────────▶ Running ──────────▶ Completed | Failed
//!    │                    │    ▲
//!    │           suspend  ▼    │ resume
//!    │                  Suspended ──────────▶ Completed | Failed
//!    └──────────────── finalize ────────────▶ Completed | Failed
//! ```
//!
//! Transitions are pure: each takes the current header and returns the
//! next one, leaving persistence to the caller.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_state::{TrajectoryHeader, TrajectoryStatus};

use crate::error::{HarnessError, HarnessResult};

/// Terminal outcome requested at finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
}

impl Outcome {
    pub fn status(self) -> TrajectoryStatus {
        match self {
            Outcome::Completed => TrajectoryStatus::Completed,
            Outcome::Failed => TrajectoryStatus::Failed,
        }
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Outcome::Completed),
            "failed" => Ok(Outcome::Failed),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrajectoryStateMachine {
    stale_after: Duration,
}

impl TrajectoryStateMachine {
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// ∅ → Pending.
    pub fn create(&self, agent_id: &str, now: DateTime<Utc>) -> TrajectoryHeader {
        TrajectoryHeader::new(agent_id, now)
    }

    /// Whether a step may be appended right now.
    pub fn check_appendable(&self, header: &TrajectoryHeader) -> HarnessResult<()> {
        match header.status {
            TrajectoryStatus::Pending | TrajectoryStatus::Running => Ok(()),
            TrajectoryStatus::Suspended => Err(invalid(header, "adjudicate")),
            TrajectoryStatus::Completed | TrajectoryStatus::Failed => {
                Err(HarnessError::AppendAfterFinalize {
                    trajectory_id: header.id.to_string(),
                    status: header.status,
                })
            }
        }
    }

    /// Header after one more step: bumps the count and moves Pending → Running.
    pub fn step_appended(
        &self,
        header: &TrajectoryHeader,
        now: DateTime<Utc>,
    ) -> HarnessResult<TrajectoryHeader> {
        self.check_appendable(header)?;
        let mut next = header.next_revision();
        next.step_count += 1;
        next.updated_at = now;
        if next.status == TrajectoryStatus::Pending {
            next.status = TrajectoryStatus::Running;
            next.started_at = Some(now);
        }
        Ok(next)
    }

    /// Running → Suspended.
    pub fn suspend(
        &self,
        header: &TrajectoryHeader,
        now: DateTime<Utc>,
    ) -> HarnessResult<TrajectoryHeader> {
        match header.status {
            TrajectoryStatus::Running => {
                let mut next = header.next_revision();
                next.status = TrajectoryStatus::Suspended;
                next.updated_at = now;
                Ok(next)
            }
            status if status.is_terminal() => Err(finalized(header)),
            _ => Err(invalid(header, "suspend")),
        }
    }

    /// Suspended → Running, or a stale Running trajectory re-claimed by a
    /// new session. Only the owning agent may resume.
    pub fn resume(
        &self,
        header: &TrajectoryHeader,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> HarnessResult<TrajectoryHeader> {
        if header.agent_id != agent_id {
            return Err(HarnessError::ResumeMismatch {
                trajectory_id: header.id.to_string(),
                owner: header.agent_id.clone(),
                presented: agent_id.to_string(),
            });
        }
        match header.status {
            TrajectoryStatus::Suspended => {}
            TrajectoryStatus::Running if self.is_stale(header, now) => {}
            TrajectoryStatus::Running => {
                return Err(HarnessError::WriterConflict {
                    trajectory_id: header.id.to_string(),
                })
            }
            TrajectoryStatus::Pending => return Err(invalid(header, "resume")),
            TrajectoryStatus::Completed | TrajectoryStatus::Failed => {
                return Err(finalized(header))
            }
        }
        let mut next = header.next_revision();
        next.status = TrajectoryStatus::Running;
        next.updated_at = now;
        Ok(next)
    }

    /// Pending | Running | Suspended → Completed | Failed.
    pub fn finalize(
        &self,
        header: &TrajectoryHeader,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> HarnessResult<TrajectoryHeader> {
        if header.is_terminal() {
            return Err(finalized(header));
        }
        let mut next = header.next_revision();
        next.status = outcome.status();
        next.updated_at = now;
        next.ended_at = Some(now);
        Ok(next)
    }

    /// A Running trajectory nobody has touched for `stale_after`.
    pub fn is_stale(&self, header: &TrajectoryHeader, now: DateTime<Utc>) -> bool {
        let idle = now - header.updated_at;
        match idle.to_std() {
            Ok(idle) => idle >= self.stale_after,
            // updated_at in the future: clock skew, not stale.
            Err(_) => false,
        }
    }
}

fn invalid(header: &TrajectoryHeader, operation: &'static str) -> HarnessError {
    HarnessError::InvalidTransition {
        trajectory_id: header.id.to_string(),
        status: header.status,
        operation,
    }
}

fn finalized(header: &TrajectoryHeader) -> HarnessError {
    HarnessError::TrajectoryFinalized {
        trajectory_id: header.id.to_string(),
        status: header.status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> TrajectoryStateMachine {
        TrajectoryStateMachine::new(Duration::from_secs(300))
    }

    fn running(now: DateTime<Utc>) -> TrajectoryHeader {
        let m = machine();
        let header = m.create("agent-1", now);
        m.step_appended(&header, now).unwrap()
    }

    #[test]
    fn first_append_starts_the_trajectory() {
        let now = Utc::now();
        let header = running(now);
        assert_eq!(header.status, TrajectoryStatus::Running);
        assert_eq!(header.started_at, Some(now));
        assert_eq!(header.step_count, 1);

        let later = now + chrono::Duration::seconds(1);
        let next = machine().step_appended(&header, later).unwrap();
        assert_eq!(next.started_at, Some(now));
        assert_eq!(next.step_count, 2);
    }

    #[test]
    fn suspend_and_resume() {
        let now = Utc::now();
        let m = machine();
        let suspended = m.suspend(&running(now), now).unwrap();
        assert_eq!(suspended.status, TrajectoryStatus::Suspended);
        assert!(matches!(
            m.check_appendable(&suspended),
            Err(HarnessError::InvalidTransition { .. })
        ));

        let resumed = m.resume(&suspended, "agent-1", now).unwrap();
        assert_eq!(resumed.status, TrajectoryStatus::Running);
        assert_eq!(resumed.step_count, 1);
    }

    #[test]
    fn resume_by_other_agent_rejected() {
        let now = Utc::now();
        let m = machine();
        let suspended = m.suspend(&running(now), now).unwrap();
        assert!(matches!(
            m.resume(&suspended, "agent-2", now),
            Err(HarnessError::ResumeMismatch { .. })
        ));
    }

    #[test]
    fn resume_running_depends_on_staleness() {
        let now = Utc::now();
        let m = machine();
        let header = running(now);
        assert!(matches!(
            m.resume(&header, "agent-1", now + chrono::Duration::seconds(10)),
            Err(HarnessError::WriterConflict { .. })
        ));
        let later = now + chrono::Duration::seconds(301);
        assert!(m.is_stale(&header, later));
        let resumed = m.resume(&header, "agent-1", later).unwrap();
        assert_eq!(resumed.updated_at, later);
    }

    #[test]
    fn resume_pending_is_invalid() {
        let now = Utc::now();
        let m = machine();
        let header = m.create("agent-1", now);
        assert!(matches!(
            m.resume(&header, "agent-1", now),
            Err(HarnessError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn finalize_rules() {
        let now = Utc::now();
        let m = machine();

        // Degenerate trajectories may finalize straight from Pending.
        let pending = m.create("agent-1", now);
        let done = m.finalize(&pending, Outcome::Completed, now).unwrap();
        assert_eq!(done.status, TrajectoryStatus::Completed);
        assert_eq!(done.ended_at, Some(now));

        assert!(matches!(
            m.finalize(&done, Outcome::Failed, now),
            Err(HarnessError::TrajectoryFinalized { .. })
        ));
        assert!(matches!(
            m.check_appendable(&done),
            Err(HarnessError::AppendAfterFinalize { .. })
        ));
        assert!(matches!(
            m.resume(&done, "agent-1", now),
            Err(HarnessError::TrajectoryFinalized { .. })
        ));

        let suspended = m.suspend(&running(now), now).unwrap();
        let failed = m.finalize(&suspended, Outcome::Failed, now).unwrap();
        assert_eq!(failed.status, TrajectoryStatus::Failed);
    }

    #[test]
    fn suspend_requires_running() {
        let now = Utc::now();
        let m = machine();
        let pending = m.create("agent-1", now);
        assert!(matches!(
            m.suspend(&pending, now),
            Err(HarnessError::InvalidTransition { .. })
        ));
    }
}
