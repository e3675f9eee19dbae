//! Storage trait definitions for Tollgate
//!
//! `TrajectoryStore` is the single persistence seam: agent registration,
//! trajectory headers, append-only steps and keyset-paged listing.
//!
//! Writers use compare-and-swap semantics. Every header written back must
//! carry the stored `revision` plus one (see
//! [`TrajectoryHeader::next_revision`]); `append_step` also checks the step
//! count and `update_header` the stored status. A writer that lost a race
//! gets a conflict error instead of overwriting the winner.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::model::{Agent, Step, Trajectory, TrajectoryHeader, TrajectoryId, TrajectoryStatus};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

/// Keyset position of the last item handed out.
///
/// Listings are ordered by `(key, id)` ascending and resume strictly after
/// the cursor, so items inserted behind the cursor never shift a page and no
/// item is returned twice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageCursor {
    /// Primary ordering key (creation time in microseconds for trajectories).
    pub key: i64,
    /// Tie-breaker.
    pub id: String,
}

impl PageCursor {
    pub fn new(key: i64, id: impl Into<String>) -> Self {
        Self { key, id: id.into() }
    }

    /// Cursor for a trajectory header.
    pub fn for_header(header: &TrajectoryHeader) -> Self {
        Self::new(header.created_at.timestamp_micros(), header.id.as_str())
    }

    /// Cursor for an agent (agents are ordered by id alone).
    pub fn for_agent(agent: &Agent) -> Self {
        Self::new(0, agent.id.as_str())
    }

    /// Encode as an opaque token.
    pub fn encode(&self) -> String {
        // Serializing two plain fields cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(json)
    }

    /// Decode a token produced by [`PageCursor::encode`].
    pub fn decode(token: &str) -> StorageResult<Self> {
        let bytes = hex::decode(token).map_err(|e| StorageError::InvalidPageToken {
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| StorageError::InvalidPageToken {
            reason: e.to_string(),
        })
    }

    /// Decode an optional, possibly empty token.
    pub fn decode_opt(token: Option<&str>) -> StorageResult<Option<Self>> {
        match token {
            None => Ok(None),
            Some(t) if t.is_empty() => Ok(None),
            Some(t) => Self::decode(t).map(Some),
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` when the listing is exhausted.
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_page_token: None,
        }
    }

    /// Build a page from up to `page_size + 1` ordered candidates.
    ///
    /// The extra candidate only signals that another page exists.
    pub fn from_candidates(
        mut candidates: Vec<T>,
        page_size: usize,
        cursor: impl Fn(&T) -> PageCursor,
    ) -> Self {
        let has_more = candidates.len() > page_size;
        candidates.truncate(page_size);
        let next_page_token = if has_more {
            candidates.last().map(|last| cursor(last).encode())
        } else {
            None
        };
        Self {
            items: candidates,
            next_page_token,
        }
    }
}

/// Filter for trajectory listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryFilter {
    pub agent_id: Option<String>,
    pub status: Option<TrajectoryStatus>,
}

impl TrajectoryFilter {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: TrajectoryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, header: &TrajectoryHeader) -> bool {
        self.agent_id
            .as_deref()
            .map(|a| header.agent_id == a)
            .unwrap_or(true)
            && self.status.map(|s| header.status == s).unwrap_or(true)
    }
}

// ---------------------------------------------------------------------------
// TrajectoryStore
// ---------------------------------------------------------------------------

/// Keyed trajectory persistence.
///
/// Guarantees:
/// - Steps of a trajectory carry contiguous `seq` values starting at 1.
/// - `append_step` is all-or-nothing: the step and the updated header are
///   written together or not at all.
/// - Terminal trajectories accept header updates (metadata tags) but no steps.
/// - `list` pages are stable under concurrent inserts (keyset paging).
#[async_trait]
pub trait TrajectoryStore: Send + Sync {
    /// Short backend name for logs and errors.
    fn backend_name(&self) -> &'static str;

    /// Register an agent. Returns `false` if the id was already registered,
    /// in which case the stored agent is left untouched.
    async fn put_agent(&self, agent: &Agent) -> StorageResult<bool>;

    /// Look up an agent. Returns `StorageError::AgentNotFound` if absent.
    async fn get_agent(&self, agent_id: &str) -> StorageResult<Agent>;

    /// List agents ordered by id, optionally filtered by provider.
    async fn list_agents(
        &self,
        provider_id: Option<&str>,
        page_size: usize,
        page_token: Option<&str>,
    ) -> StorageResult<Page<Agent>>;

    /// Persist a new trajectory header.
    async fn create(&self, header: &TrajectoryHeader) -> StorageResult<()>;

    /// Fetch the header of a trajectory.
    async fn header(&self, id: &TrajectoryId) -> StorageResult<TrajectoryHeader>;

    /// Append `step` and replace the header with `header` atomically.
    ///
    /// Fails with `InvalidTrajectoryState` if the stored trajectory is
    /// terminal, with `SequenceConflict` unless `step.seq` is exactly one
    /// past the stored step count and `header.step_count == step.seq`, and
    /// with `RevisionConflict` unless `header.revision` is one past the
    /// stored revision.
    async fn append_step(&self, header: &TrajectoryHeader, step: &Step) -> StorageResult<()>;

    /// Replace a header whose stored status equals `expected`.
    ///
    /// Fails with `StatusConflict` if the stored status differs, with
    /// `SequenceConflict` if steps were appended since `header` was read and
    /// with `RevisionConflict` if any other write landed in between.
    async fn update_header(
        &self,
        header: &TrajectoryHeader,
        expected: TrajectoryStatus,
    ) -> StorageResult<()>;

    /// Full trajectory including steps and dispositions.
    async fn get(&self, id: &TrajectoryId) -> StorageResult<Trajectory>;

    /// Headers matching `filter`, ordered by creation time then id.
    async fn list(
        &self,
        filter: &TrajectoryFilter,
        page_size: usize,
        page_token: Option<&str>,
    ) -> StorageResult<Page<TrajectoryHeader>>;
}

/// Shared precondition check for `append_step` implementations.
pub fn check_append(
    stored: &TrajectoryHeader,
    header: &TrajectoryHeader,
    step: &Step,
) -> StorageResult<()> {
    if stored.status.is_terminal() {
        return Err(StorageError::InvalidTrajectoryState {
            trajectory_id: stored.id.to_string(),
            status: stored.status,
            expected: "pending, running or suspended".to_string(),
        });
    }
    let expected = stored.step_count + 1;
    if step.seq != expected || header.step_count != step.seq {
        return Err(StorageError::SequenceConflict {
            trajectory_id: stored.id.to_string(),
            expected,
            actual: step.seq,
        });
    }
    check_revision(stored, header)
}

/// Shared precondition check for `update_header` implementations.
pub fn check_update(
    stored: &TrajectoryHeader,
    header: &TrajectoryHeader,
    expected: TrajectoryStatus,
) -> StorageResult<()> {
    if stored.status != expected {
        return Err(StorageError::StatusConflict {
            trajectory_id: stored.id.to_string(),
            stored: stored.status.to_string(),
            expected: expected.to_string(),
        });
    }
    if stored.step_count != header.step_count {
        return Err(StorageError::SequenceConflict {
            trajectory_id: stored.id.to_string(),
            expected: stored.step_count,
            actual: header.step_count,
        });
    }
    check_revision(stored, header)
}

fn check_revision(stored: &TrajectoryHeader, header: &TrajectoryHeader) -> StorageResult<()> {
    let expected = stored.revision + 1;
    if header.revision != expected {
        return Err(StorageError::RevisionConflict {
            trajectory_id: stored.id.to_string(),
            expected,
            actual: header.revision,
        });
    }
    Ok(())
}
