//! SurrealDB-backed TrajectoryStore implementation
//!
//! Uses the rows in `schema` for persistence, converting to/from `model`
//! types at the boundary. Step appends and header updates run as single
//! SurrealQL transactions guarded on the stored `step_count`, `status` and
//! `revision`.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::model::{Agent, Step, Trajectory, TrajectoryHeader, TrajectoryId, TrajectoryStatus};
use crate::schema::{AgentRow, StepRow, TrajectoryRow};
use crate::storage_traits::*;

/// Marker thrown by guarded transactions when the stored row moved.
const CONFLICT_MARKER: &str = "tollgate:conflict";

const APPEND_SQL: &str = r#"
    BEGIN TRANSACTION;
    LET $cur = (SELECT status, step_count, revision FROM trajectories WHERE trajectory_id = $tid)[0];
    IF $cur.step_count != $prev OR $cur.status != $prev_status OR $cur.revision != $prev_rev { THROW "tollgate:conflict" };
    CREATE steps CONTENT $step;
    UPDATE trajectories MERGE $row WHERE trajectory_id = $tid;
    COMMIT TRANSACTION;
"#;

const UPDATE_SQL: &str = r#"
    BEGIN TRANSACTION;
    LET $cur = (SELECT status, step_count, revision FROM trajectories WHERE trajectory_id = $tid)[0];
    IF $cur.step_count != $count OR $cur.status != $expected OR $cur.revision != $prev_rev { THROW "tollgate:conflict" };
    UPDATE trajectories MERGE $row WHERE trajectory_id = $tid;
    COMMIT TRANSACTION;
"#;

fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Unique-index violations and thrown guards both mean "someone else wrote".
fn is_conflict(message: &str) -> bool {
    message.contains(CONFLICT_MARKER) || message.contains("already contains")
}

/// SurrealDB-backed implementation of [`TrajectoryStore`].
#[derive(Clone)]
pub struct SurrealTrajectoryStore {
    db: Surreal<Any>,
}

impl SurrealTrajectoryStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `tollgate/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect(&StoreConfig::in_memory()).await
    }

    /// Connect using `TOLLGATE_DB_*` environment variables.
    pub async fn from_env() -> crate::Result<Self> {
        let config = StoreConfig::from_env().map_err(StateError::Connection)?;
        Self::connect(&config).await
    }

    /// Connect, authenticate if credentials are set, and initialize the schema.
    pub async fn connect(config: &StoreConfig) -> crate::Result<Self> {
        if let Some(path) = config.local_path() {
            std::fs::create_dir_all(path).map_err(|e| {
                StateError::Connection(format!(
                    "Failed to create database directory {}: {}",
                    path, e
                ))
            })?;
        }

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            if config.is_root {
                db.signin(Root {
                    username: username.as_str(),
                    password: password.as_str(),
                })
                .await
                .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
            } else {
                db.signin(Database {
                    namespace: &config.namespace,
                    database: &config.database,
                    username: username.as_str(),
                    password: password.as_str(),
                })
                .await
                .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
            }
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!(endpoint = %config.endpoint, "SurrealTrajectoryStore connected");
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_row(&self, id: &TrajectoryId) -> StorageResult<TrajectoryRow> {
        let tid = id.as_str().to_string();
        let mut res = self
            .db
            .query("SELECT * FROM trajectories WHERE trajectory_id = $tid LIMIT 1")
            .bind(("tid", tid))
            .await
            .map_err(backend)?;
        let rows: Vec<TrajectoryRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::TrajectoryNotFound {
                trajectory_id: id.to_string(),
            })
    }

    async fn fetch_steps(&self, id: &TrajectoryId) -> StorageResult<Vec<Step>> {
        let tid = id.as_str().to_string();
        let mut res = self
            .db
            .query("SELECT * FROM steps WHERE trajectory_id = $tid ORDER BY seq ASC")
            .bind(("tid", tid))
            .await
            .map_err(backend)?;
        let rows: Vec<StepRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(StepRow::into_step).collect()
    }
}

#[async_trait]
impl TrajectoryStore for SurrealTrajectoryStore {
    fn backend_name(&self) -> &'static str {
        "surrealdb"
    }

    async fn put_agent(&self, agent: &Agent) -> StorageResult<bool> {
        match self.get_agent(&agent.id).await {
            Ok(_) => return Ok(false),
            Err(StorageError::AgentNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let row = AgentRow::from_agent(agent)?;
        let created: Result<Option<AgentRow>, _> = self.db.create("agents").content(row).await;
        match created {
            Ok(_) => {
                debug!(agent_id = %agent.id, "agent registered");
                Ok(true)
            }
            // Lost a registration race; the first writer's agent stays.
            Err(e) if is_conflict(&e.to_string()) => Ok(false),
            Err(e) => Err(backend(e)),
        }
    }

    async fn get_agent(&self, agent_id: &str) -> StorageResult<Agent> {
        let aid = agent_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM agents WHERE agent_id = $aid LIMIT 1")
            .bind(("aid", aid))
            .await
            .map_err(backend)?;
        let rows: Vec<AgentRow> = res.take(0).map_err(backend)?;
        match rows.into_iter().next() {
            Some(row) => row.into_agent(),
            None => Err(StorageError::AgentNotFound {
                agent_id: agent_id.to_string(),
            }),
        }
    }

    async fn list_agents(
        &self,
        provider_id: Option<&str>,
        page_size: usize,
        page_token: Option<&str>,
    ) -> StorageResult<Page<Agent>> {
        let cursor = PageCursor::decode_opt(page_token)?;
        let page_size = page_size.max(1);

        let mut conditions = Vec::new();
        if provider_id.is_some() {
            conditions.push("provider_id = $provider");
        }
        if cursor.is_some() {
            conditions.push("agent_id > $after");
        }
        let sql = format!(
            "SELECT * FROM agents {} ORDER BY agent_id ASC LIMIT $limit",
            where_clause(&conditions)
        );

        let mut res = self
            .db
            .query(sql)
            .bind(("provider", provider_id.map(str::to_string)))
            .bind(("after", cursor.map(|c| c.id)))
            .bind(("limit", i64::try_from(page_size.saturating_add(1)).unwrap_or(i64::MAX)))
            .await
            .map_err(backend)?;
        let rows: Vec<AgentRow> = res.take(0).map_err(backend)?;
        let candidates = rows
            .into_iter()
            .map(AgentRow::into_agent)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Page::from_candidates(
            candidates,
            page_size,
            PageCursor::for_agent,
        ))
    }

    async fn create(&self, header: &TrajectoryHeader) -> StorageResult<()> {
        let row = TrajectoryRow::from_header(header)?;
        let created: Result<Option<TrajectoryRow>, _> =
            self.db.create("trajectories").content(row).await;
        match created {
            Ok(_) => {
                debug!(trajectory_id = %header.id, "trajectory row created");
                Ok(())
            }
            Err(e) if is_conflict(&e.to_string()) => Err(StorageError::DuplicateTrajectory {
                trajectory_id: header.id.to_string(),
            }),
            Err(e) => Err(backend(e)),
        }
    }

    async fn header(&self, id: &TrajectoryId) -> StorageResult<TrajectoryHeader> {
        self.fetch_row(id).await?.into_header()
    }

    async fn append_step(&self, header: &TrajectoryHeader, step: &Step) -> StorageResult<()> {
        let stored = self.header(&header.id).await?;
        check_append(&stored, header, step)?;

        let step_row = StepRow::from_step(&header.id, step)?;
        let row = TrajectoryRow::from_header(header)?;

        let result = self
            .db
            .query(APPEND_SQL)
            .bind(("tid", header.id.as_str().to_string()))
            .bind(("prev", stored.step_count as i64))
            .bind(("prev_status", stored.status.as_str().to_string()))
            .bind(("prev_rev", stored.revision as i64))
            .bind(("step", step_row))
            .bind(("row", row))
            .await
            .and_then(|res| res.check());

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                // A failed transaction reports on every statement; re-read so
                // the caller sees what actually moved.
                let now = self.header(&header.id).await?;
                check_append(&now, header, step)?;
                if is_conflict(&e.to_string()) {
                    Err(StorageError::SequenceConflict {
                        trajectory_id: header.id.to_string(),
                        expected: now.step_count + 1,
                        actual: step.seq,
                    })
                } else {
                    Err(backend(e))
                }
            }
        }
    }

    async fn update_header(
        &self,
        header: &TrajectoryHeader,
        expected: TrajectoryStatus,
    ) -> StorageResult<()> {
        let stored = self.header(&header.id).await?;
        check_update(&stored, header, expected)?;

        let row = TrajectoryRow::from_header(header)?;
        let result = self
            .db
            .query(UPDATE_SQL)
            .bind(("tid", header.id.as_str().to_string()))
            .bind(("count", header.step_count as i64))
            .bind(("expected", expected.as_str().to_string()))
            .bind(("prev_rev", stored.revision as i64))
            .bind(("row", row))
            .await
            .and_then(|res| res.check());

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let now = self.header(&header.id).await?;
                check_update(&now, header, expected)?;
                if is_conflict(&e.to_string()) {
                    Err(StorageError::StatusConflict {
                        trajectory_id: header.id.to_string(),
                        stored: now.status.to_string(),
                        expected: expected.to_string(),
                    })
                } else {
                    Err(backend(e))
                }
            }
        }
    }

    async fn get(&self, id: &TrajectoryId) -> StorageResult<Trajectory> {
        let header = self.header(id).await?;
        let steps = self.fetch_steps(id).await?;
        Ok(Trajectory { header, steps })
    }

    async fn list(
        &self,
        filter: &TrajectoryFilter,
        page_size: usize,
        page_token: Option<&str>,
    ) -> StorageResult<Page<TrajectoryHeader>> {
        let cursor = PageCursor::decode_opt(page_token)?;
        let page_size = page_size.max(1);

        let mut conditions = Vec::new();
        if filter.agent_id.is_some() {
            conditions.push("agent_id = $agent");
        }
        if filter.status.is_some() {
            conditions.push("status = $status");
        }
        if cursor.is_some() {
            conditions.push(
                "(created_micros > $after_key OR (created_micros = $after_key AND trajectory_id > $after_id))",
            );
        }
        let sql = format!(
            "SELECT * FROM trajectories {} ORDER BY created_micros ASC, trajectory_id ASC LIMIT $limit",
            where_clause(&conditions)
        );

        let (after_key, after_id) = match cursor {
            Some(c) => (c.key, c.id),
            None => (0, String::new()),
        };
        let mut res = self
            .db
            .query(sql)
            .bind(("agent", filter.agent_id.clone()))
            .bind(("status", filter.status.map(|s| s.as_str().to_string())))
            .bind(("after_key", after_key))
            .bind(("after_id", after_id))
            .bind(("limit", i64::try_from(page_size.saturating_add(1)).unwrap_or(i64::MAX)))
            .await
            .map_err(backend)?;
        let rows: Vec<TrajectoryRow> = res.take(0).map_err(backend)?;
        let candidates = rows
            .into_iter()
            .map(TrajectoryRow::into_header)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Page::from_candidates(
            candidates,
            page_size,
            PageCursor::for_header,
        ))
    }
}

fn where_clause(conditions: &[&str]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}
