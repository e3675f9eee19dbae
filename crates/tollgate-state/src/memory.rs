//! In-memory trajectory store.
//!
//! Provides `MemoryTrajectoryStore`, which satisfies the `TrajectoryStore`
//! contract without any external dependencies. Contents live as long as
//! the store instance.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{Agent, Step, Trajectory, TrajectoryHeader, TrajectoryId, TrajectoryStatus};
use crate::storage_traits::*;

#[derive(Debug)]
struct Entry {
    header: TrajectoryHeader,
    steps: Vec<Step>,
}

#[derive(Debug, Default)]
struct Inner {
    agents: BTreeMap<String, Agent>,
    trajectories: HashMap<String, Entry>,
    /// Listing order: (created_at micros, id).
    order: BTreeSet<(i64, String)>,
}

impl Inner {
    fn entry(&self, id: &TrajectoryId) -> StorageResult<&Entry> {
        self.trajectories
            .get(id.as_str())
            .ok_or_else(|| StorageError::TrajectoryNotFound {
                trajectory_id: id.to_string(),
            })
    }

    fn entry_mut(&mut self, id: &TrajectoryId) -> StorageResult<&mut Entry> {
        self.trajectories
            .get_mut(id.as_str())
            .ok_or_else(|| StorageError::TrajectoryNotFound {
                trajectory_id: id.to_string(),
            })
    }
}

/// In-memory store backed by a `HashMap<TrajectoryId, Entry>` plus an
/// ordered index for keyset paging.
#[derive(Debug, Default)]
pub struct MemoryTrajectoryStore {
    inner: Mutex<Inner>,
}

impl MemoryTrajectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }
}

/// Lower bound of a keyset scan that resumes strictly after `cursor`.
fn scan_start(cursor: &Option<PageCursor>) -> Bound<(i64, String)> {
    match cursor {
        Some(c) => Bound::Excluded((c.key, c.id.clone())),
        None => Bound::Unbounded,
    }
}

#[async_trait]
impl TrajectoryStore for MemoryTrajectoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put_agent(&self, agent: &Agent) -> StorageResult<bool> {
        let mut inner = self.lock()?;
        if inner.agents.contains_key(&agent.id) {
            return Ok(false);
        }
        inner.agents.insert(agent.id.clone(), agent.clone());
        Ok(true)
    }

    async fn get_agent(&self, agent_id: &str) -> StorageResult<Agent> {
        let inner = self.lock()?;
        inner
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| StorageError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
    }

    async fn list_agents(
        &self,
        provider_id: Option<&str>,
        page_size: usize,
        page_token: Option<&str>,
    ) -> StorageResult<Page<Agent>> {
        let cursor = PageCursor::decode_opt(page_token)?;
        let page_size = page_size.max(1);
        let inner = self.lock()?;
        let start = match &cursor {
            Some(c) => Bound::Excluded(c.id.clone()),
            None => Bound::Unbounded,
        };
        let candidates: Vec<Agent> = inner
            .agents
            .range((start, Bound::Unbounded))
            .map(|(_, agent)| agent)
            .filter(|a| provider_id.map(|p| a.provider_id == p).unwrap_or(true))
            .take(page_size.saturating_add(1))
            .cloned()
            .collect();
        Ok(Page::from_candidates(
            candidates,
            page_size,
            PageCursor::for_agent,
        ))
    }

    async fn create(&self, header: &TrajectoryHeader) -> StorageResult<()> {
        let mut inner = self.lock()?;
        if inner.trajectories.contains_key(header.id.as_str()) {
            return Err(StorageError::DuplicateTrajectory {
                trajectory_id: header.id.to_string(),
            });
        }
        inner.order.insert((
            header.created_at.timestamp_micros(),
            header.id.as_str().to_string(),
        ));
        inner.trajectories.insert(
            header.id.as_str().to_string(),
            Entry {
                header: header.clone(),
                steps: Vec::new(),
            },
        );
        Ok(())
    }

    async fn header(&self, id: &TrajectoryId) -> StorageResult<TrajectoryHeader> {
        let inner = self.lock()?;
        Ok(inner.entry(id)?.header.clone())
    }

    async fn append_step(&self, header: &TrajectoryHeader, step: &Step) -> StorageResult<()> {
        let mut inner = self.lock()?;
        let entry = inner.entry_mut(&header.id)?;
        check_append(&entry.header, header, step)?;
        entry.steps.push(step.clone());
        entry.header = header.clone();
        Ok(())
    }

    async fn update_header(
        &self,
        header: &TrajectoryHeader,
        expected: TrajectoryStatus,
    ) -> StorageResult<()> {
        let mut inner = self.lock()?;
        let entry = inner.entry_mut(&header.id)?;
        check_update(&entry.header, header, expected)?;
        entry.header = header.clone();
        Ok(())
    }

    async fn get(&self, id: &TrajectoryId) -> StorageResult<Trajectory> {
        let inner = self.lock()?;
        let entry = inner.entry(id)?;
        Ok(Trajectory {
            header: entry.header.clone(),
            steps: entry.steps.clone(),
        })
    }

    async fn list(
        &self,
        filter: &TrajectoryFilter,
        page_size: usize,
        page_token: Option<&str>,
    ) -> StorageResult<Page<TrajectoryHeader>> {
        let cursor = PageCursor::decode_opt(page_token)?;
        let page_size = page_size.max(1);
        let inner = self.lock()?;
        let candidates: Vec<TrajectoryHeader> = inner
            .order
            .range((scan_start(&cursor), Bound::Unbounded))
            .filter_map(|(_, id)| inner.trajectories.get(id))
            .map(|entry| &entry.header)
            .filter(|h| filter.matches(h))
            .take(page_size.saturating_add(1))
            .cloned()
            .collect();
        Ok(Page::from_candidates(
            candidates,
            page_size,
            PageCursor::for_header,
        ))
    }
}
