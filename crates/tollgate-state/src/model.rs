//! Persisted records for governed agent executions.
//!
//! - `Agent` / `Tool`: registered once, identity is `Agent::id`
//! - `TrajectoryHeader`: lifecycle state of one execution run, no steps
//! - `Trajectory`: header plus the ordered, append-only `Step` list
//! - `Disposition`: resolved allow / deny / escalate attached to a step

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Returned when a string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares `as_str`, `Display` and `FromStr` for a fieldless snake_case enum.
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// A named, typed tool parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Source code backing a tool, when the provider exposes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCode {
    pub language: String,
    pub code: String,
}

/// A tool the agent may invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// JSON schema describing the tool arguments.
    #[serde(default)]
    pub parameters_json_schema: Option<String>,
    #[serde(default)]
    pub source: Option<SourceCode>,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            parameters_json_schema: None,
            source: None,
        }
    }

    /// Add a parameter (builder pattern).
    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        self.parameters.push(Parameter {
            name: name.into(),
            description: description.into(),
            kind: kind.into(),
        });
        self
    }
}

/// A governed agent. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub provider_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub tools: Vec<Tool>,
}

impl Agent {
    pub fn new(id: impl Into<String>, provider_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            name: name.into(),
            description: String::new(),
            instruction: String::new(),
            tools: Vec::new(),
        }
    }

    /// Append a tool (builder pattern).
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Interception point in the agent execution loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PreRun,
    PreModel,
    PostModel,
    PreTool,
    PostTool,
    PostRun,
}

string_enum!(Stage, "stage", {
    PreRun => "pre_run",
    PreModel => "pre_model",
    PostModel => "post_model",
    PreTool => "pre_tool",
    PostTool => "post_tool",
    PostRun => "post_run",
});

/// Actor that produced the step content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    Tool,
    System,
}

string_enum!(Role, "role", {
    User => "user",
    Model => "model",
    Tool => "tool",
    System => "system",
});

/// Content of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "content_type", rename_all = "snake_case")]
pub enum Content {
    Prompt {
        text: String,
    },
    ToolRequest {
        tool_id: String,
        args: serde_json::Value,
    },
    ToolResponse {
        tool_id: String,
        response: serde_json::Value,
    },
}

impl Content {
    pub fn prompt(text: impl Into<String>) -> Self {
        Content::Prompt { text: text.into() }
    }

    pub fn tool_request(tool_id: impl Into<String>, args: serde_json::Value) -> Self {
        Content::ToolRequest {
            tool_id: tool_id.into(),
            args,
        }
    }

    pub fn tool_response(tool_id: impl Into<String>, response: serde_json::Value) -> Self {
        Content::ToolResponse {
            tool_id: tool_id.into(),
            response,
        }
    }

    /// Tool identifier for tool content, `None` for prompts.
    pub fn tool_id(&self) -> Option<&str> {
        match self {
            Content::Prompt { .. } => None,
            Content::ToolRequest { tool_id, .. } | Content::ToolResponse { tool_id, .. } => {
                Some(tool_id)
            }
        }
    }
}

/// Outcome of one adjudication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    Escalate,
}

string_enum!(Decision, "decision", {
    Allow => "allow",
    Deny => "deny",
    Escalate => "escalate",
});

/// A rule that contributed to a disposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub id: String,
    pub description: String,
    pub escalate: bool,
    #[serde(default)]
    pub escalate_target: Option<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

/// Resolved decision, reason and contributing rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disposition {
    pub decision: Decision,
    pub reason: String,
    #[serde(default)]
    pub policies: Vec<PolicyMetadata>,
}

impl Disposition {
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }

    pub fn is_denied(&self) -> bool {
        self.decision == Decision::Deny
    }

    pub fn is_escalated(&self) -> bool {
        self.decision == Decision::Escalate
    }

    /// Escalation target of the first escalating policy that names one.
    pub fn escalate_target(&self) -> Option<&str> {
        self.policies
            .iter()
            .filter(|p| p.escalate)
            .find_map(|p| p.escalate_target.as_deref())
    }
}

/// Whether dispositions are enforced or only observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    #[default]
    Govern,
    Monitor,
}

string_enum!(PolicyMode, "policy mode", {
    Govern => "govern",
    Monitor => "monitor",
});

/// One recorded interception point. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Contiguous sequence number within the trajectory, starting at 1.
    pub seq: u64,
    pub stage: Stage,
    pub role: Role,
    pub content: Content,
    pub created_at: DateTime<Utc>,
    /// Optional state/context snapshot supplied by the caller.
    #[serde(default)]
    pub snapshot: Option<serde_json::Value>,
    pub mode: PolicyMode,
    #[serde(default)]
    pub disposition: Option<Disposition>,
}

// ---------------------------------------------------------------------------
// Trajectories
// ---------------------------------------------------------------------------

/// Unique identifier for a trajectory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrajectoryId(pub String);

impl TrajectoryId {
    /// Generate a new random id.
    pub fn new() -> Self {
        TrajectoryId(format!("traj-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TrajectoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrajectoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TrajectoryId {
    fn from(s: &str) -> Self {
        TrajectoryId(s.to_string())
    }
}

/// Lifecycle status of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
}

string_enum!(TrajectoryStatus, "trajectory status", {
    Pending => "pending",
    Running => "running",
    Suspended => "suspended",
    Completed => "completed",
    Failed => "failed",
});

impl TrajectoryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrajectoryStatus::Completed | TrajectoryStatus::Failed)
    }
}

/// Trajectory without its steps. This is what listings return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryHeader {
    pub id: TrajectoryId,
    pub agent_id: String,
    pub status: TrajectoryStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Number of steps appended so far; also the last allocated seq.
    pub step_count: u64,
    /// Bumped by every committed write to the header.
    #[serde(default)]
    pub revision: u64,
}

impl TrajectoryHeader {
    /// A fresh `Pending` header for the given agent.
    pub fn new(agent_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: TrajectoryId::new(),
            agent_id: agent_id.into(),
            status: TrajectoryStatus::Pending,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            step_count: 0,
            revision: 0,
        }
    }

    /// Copy to be written back: one revision past `self`.
    pub fn next_revision(&self) -> Self {
        let mut next = self.clone();
        next.revision += 1;
        next
    }

    /// Seconds between start and end, when both are known.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Full trajectory with dispositions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    #[serde(flatten)]
    pub header: TrajectoryHeader,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Trajectory {
    pub fn id(&self) -> &TrajectoryId {
        &self.header.id
    }

    pub fn steps_by_role(&self, role: Role) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |s| s.role == role)
    }

    pub fn steps_by_stage(&self, stage: Stage) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |s| s.stage == stage)
    }
}
