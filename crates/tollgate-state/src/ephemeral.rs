//! History-less store for deployments without durable storage.
//!
//! Lifecycle headers and agents are tracked so sequencing and state
//! transitions keep working, but steps are dropped after validation.
//! Reads that would need history answer `StorageError::HistoryUnavailable`
//! instead of an empty result.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{Agent, Step, Trajectory, TrajectoryHeader, TrajectoryId, TrajectoryStatus};
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Inner {
    agents: HashMap<String, Agent>,
    headers: HashMap<String, TrajectoryHeader>,
}

/// Store that keeps headers only.
#[derive(Debug, Default)]
pub struct EphemeralTrajectoryStore {
    inner: Mutex<Inner>,
}

impl EphemeralTrajectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Backend("ephemeral store lock poisoned".to_string()))
    }

    fn unavailable(&self) -> StorageError {
        StorageError::HistoryUnavailable {
            backend: self.backend_name().to_string(),
        }
    }
}

fn not_found(id: &TrajectoryId) -> StorageError {
    StorageError::TrajectoryNotFound {
        trajectory_id: id.to_string(),
    }
}

#[async_trait]
impl TrajectoryStore for EphemeralTrajectoryStore {
    fn backend_name(&self) -> &'static str {
        "ephemeral"
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
        _provider_id: Option<&str>,
        _page_size: usize,
        _page_token: Option<&str>,
    ) -> StorageResult<Page<Agent>> {
        Err(self.unavailable())
    }

    async fn create(&self, header: &TrajectoryHeader) -> StorageResult<()> {
        let mut inner = self.lock()?;
        if inner.headers.contains_key(header.id.as_str()) {
            return Err(StorageError::DuplicateTrajectory {
                trajectory_id: header.id.to_string(),
            });
        }
        inner
            .headers
            .insert(header.id.as_str().to_string(), header.clone());
        Ok(())
    }

    async fn header(&self, id: &TrajectoryId) -> StorageResult<TrajectoryHeader> {
        let inner = self.lock()?;
        inner
            .headers
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn append_step(&self, header: &TrajectoryHeader, step: &Step) -> StorageResult<()> {
        let mut inner = self.lock()?;
        let stored = inner
            .headers
            .get_mut(header.id.as_str())
            .ok_or_else(|| not_found(&header.id))?;
        check_append(stored, header, step)?;
        *stored = header.clone();
        Ok(())
    }

    async fn update_header(
        &self,
        header: &TrajectoryHeader,
        expected: TrajectoryStatus,
    ) -> StorageResult<()> {
        let mut inner = self.lock()?;
        let stored = inner
            .headers
            .get_mut(header.id.as_str())
            .ok_or_else(|| not_found(&header.id))?;
        check_update(stored, header, expected)?;
        *stored = header.clone();
        Ok(())
    }

    async fn get(&self, id: &TrajectoryId) -> StorageResult<Trajectory> {
        let inner = self.lock()?;
        if !inner.headers.contains_key(id.as_str()) {
            return Err(not_found(id));
        }
        Err(self.unavailable())
    }

    async fn list(
        &self,
        _filter: &TrajectoryFilter,
        _page_size: usize,
        _page_token: Option<&str>,
    ) -> StorageResult<Page<TrajectoryHeader>> {
        Err(self.unavailable())
    }
}
