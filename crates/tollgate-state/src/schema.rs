//! Row definitions for the Tollgate SurrealDB tables
//!
//! Tables:
//! - agents: registered agents (full agent document in `body`)
//! - trajectories: lifecycle headers, one row per trajectory
//! - steps: append-only step rows keyed by (trajectory_id, seq)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::model::{Agent, Step, TrajectoryHeader, TrajectoryId, TrajectoryStatus};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Agent row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// Agent identity (unique)
    pub agent_id: String,
    /// Provider, indexed for filtered listing
    pub provider_id: String,
    /// Full agent document
    pub body: serde_json::Value,
}

impl AgentRow {
    pub fn from_agent(agent: &Agent) -> Result<Self, StorageError> {
        Ok(Self {
            id: None,
            agent_id: agent.id.clone(),
            provider_id: agent.provider_id.clone(),
            body: serde_json::to_value(agent)?,
        })
    }

    pub fn into_agent(self) -> Result<Agent, StorageError> {
        Ok(serde_json::from_value(self.body)?)
    }
}

/// Trajectory header row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// Trajectory ID (unique)
    pub trajectory_id: String,
    /// Owning agent
    pub agent_id: String,
    /// "pending" | "running" | "suspended" | "completed" | "failed"
    pub status: String,
    /// Metadata map (JSON object)
    pub metadata: serde_json::Value,
    /// Creation time in microseconds, the keyset ordering key
    pub created_micros: i64,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Steps appended so far
    pub step_count: u64,
    /// Write counter guarding header updates
    #[serde(default)]
    pub revision: u64,
}

impl TrajectoryRow {
    pub fn from_header(header: &TrajectoryHeader) -> Result<Self, StorageError> {
        Ok(Self {
            id: None,
            trajectory_id: header.id.as_str().to_string(),
            agent_id: header.agent_id.clone(),
            status: header.status.as_str().to_string(),
            metadata: serde_json::to_value(&header.metadata)?,
            created_micros: header.created_at.timestamp_micros(),
            created_at: header.created_at,
            updated_at: header.updated_at,
            started_at: header.started_at,
            ended_at: header.ended_at,
            step_count: header.step_count,
            revision: header.revision,
        })
    }

    pub fn into_header(self) -> Result<TrajectoryHeader, StorageError> {
        let status: TrajectoryStatus = self
            .status
            .parse()
            .map_err(|e: crate::model::UnknownVariant| StorageError::Backend(e.to_string()))?;
        let metadata = if self.metadata.is_null() {
            Default::default()
        } else {
            serde_json::from_value(self.metadata)?
        };
        Ok(TrajectoryHeader {
            id: TrajectoryId(self.trajectory_id),
            agent_id: self.agent_id,
            status,
            metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            step_count: self.step_count,
            revision: self.revision,
        })
    }
}

/// Step row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// Owning trajectory
    pub trajectory_id: String,
    /// Monotonic sequence number within the trajectory (1-indexed)
    pub seq: u64,
    /// Stage name, indexed for analytics
    pub stage: String,
    /// Decision name when the step carries a disposition
    pub decision: Option<String>,
    /// Full step document
    pub body: serde_json::Value,
}

impl StepRow {
    pub fn from_step(trajectory_id: &TrajectoryId, step: &Step) -> Result<Self, StorageError> {
        Ok(Self {
            id: None,
            trajectory_id: trajectory_id.as_str().to_string(),
            seq: step.seq,
            stage: step.stage.as_str().to_string(),
            decision: step
                .disposition
                .as_ref()
                .map(|d| d.decision.as_str().to_string()),
            body: serde_json::to_value(step)?,
        })
    }

    pub fn into_step(self) -> Result<Step, StorageError> {
        Ok(serde_json::from_value(self.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Content, PolicyMode, Role, Stage};

    #[test]
    fn test_header_row_conversion() {
        let mut header = TrajectoryHeader::new("agent-1", Utc::now());
        header
            .metadata
            .insert("env".to_string(), serde_json::json!("test"));
        let row = TrajectoryRow::from_header(&header).unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.created_micros, header.created_at.timestamp_micros());

        let back = row.into_header().unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn test_unknown_status_is_backend_error() {
        let mut row = TrajectoryRow::from_header(&TrajectoryHeader::new("a", Utc::now())).unwrap();
        row.status = "exploded".to_string();
        assert!(matches!(row.into_header(), Err(StorageError::Backend(_))));
    }

    #[test]
    fn test_step_row_keeps_body() {
        let step = Step {
            seq: 3,
            stage: Stage::PreTool,
            role: Role::Model,
            content: Content::tool_request("Bash", serde_json::json!({"command": "ls"})),
            created_at: Utc::now(),
            snapshot: None,
            mode: PolicyMode::Govern,
            disposition: None,
        };
        let row = StepRow::from_step(&TrajectoryId::from("traj-1"), &step).unwrap();
        assert_eq!(row.stage, "pre_tool");
        assert_eq!(row.decision, None);
        assert_eq!(row.into_step().unwrap(), step);
    }
}
