//! Policy evaluation: facts in, matched rules out.
//!
//! The harness never interprets rules itself. It hands an
//! [`EvaluationRequest`] to a [`PolicyEngine`] through the [`PolicyGateway`]
//! and resolves the returned [`PolicyMatchResult`] into a disposition.
//!
//! # Modules
//!
//! - [`schema`]: `PolicySchema`: declared entity types and actions
//! - [`rules`]: JSON rule-set format, compilation and condition tests
//! - [`engine`]: `RuleSetEngine`, the built-in `PolicyEngine`
//! - [`gateway`]: `PolicyGateway`: timeout and error mapping around an engine

pub mod engine;
pub mod gateway;
pub mod rules;
pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use tollgate_state::PolicyMetadata;

pub use engine::RuleSetEngine;
pub use gateway::PolicyGateway;
pub use rules::{Condition, Effect, Operator, Rule, RuleSet};
pub use schema::{sanitize_action_name, ActionDecl, PolicySchema};

/// Annotation carrying the rule id. Required on every rule.
pub const ANNOTATION_ID: &str = "id";
/// Annotation used as the human-readable description.
pub const ANNOTATION_REASON: &str = "reason";
/// Annotation marking a forbid as escalating; its value is the target.
pub const ANNOTATION_ESCALATE: &str = "escalate";

// ---------------------------------------------------------------------------
// Issues and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// Whether an issue is in the policy text itself or in how it relates to
/// the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Syntax,
    Schema,
}

/// One finding from policy validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyIssue {
    pub severity: Severity,
    pub kind: IssueKind,
    /// Rule the issue belongs to, when it can be attributed.
    pub policy_id: Option<String>,
    pub message: String,
}

impl PolicyIssue {
    pub fn syntax(policy_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind: IssueKind::Syntax,
            policy_id: policy_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn schema(policy_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind: IssueKind::Schema,
            policy_id: policy_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn warning(policy_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind: IssueKind::Syntax,
            policy_id: policy_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for PolicyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match &self.policy_id {
            Some(id) => write!(f, "{level} [{id}]: {}", self.message),
            None => write!(f, "{level}: {}", self.message),
        }
    }
}

/// Join issues for error messages.
pub fn format_issues(issues: &[PolicyIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by a policy engine or the gateway around it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("policy syntax error: {}", format_issues(.0))]
    Syntax(Vec<PolicyIssue>),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("policy evaluation timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("policy engine failure: {0}")]
    Engine(String),
}

impl PolicyError {
    /// Classify a non-empty list of validation errors.
    ///
    /// Schema issues win so that undeclared actions surface as a mismatch.
    pub fn from_issues(issues: Vec<PolicyIssue>) -> Self {
        let errors: Vec<PolicyIssue> = issues.into_iter().filter(|i| i.is_error()).collect();
        if errors.iter().all(|i| i.kind == IssueKind::Schema) && !errors.is_empty() {
            PolicyError::SchemaMismatch(format_issues(&errors))
        } else {
            PolicyError::Syntax(errors)
        }
    }
}

// ---------------------------------------------------------------------------
// Policy bundle
// ---------------------------------------------------------------------------

/// Policy text and schema text evaluated together, with their digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBundle {
    policy_text: Arc<str>,
    schema_text: Arc<str>,
    digest: String,
}

impl PolicyBundle {
    pub fn new(policy_text: impl Into<String>, schema_text: impl Into<String>) -> Self {
        let policy_text: String = policy_text.into();
        let schema_text: String = schema_text.into();
        let digest = bundle_digest(&policy_text, &schema_text);
        Self {
            policy_text: Arc::from(policy_text),
            schema_text: Arc::from(schema_text),
            digest,
        }
    }

    pub fn policy_text(&self) -> &str {
        &self.policy_text
    }

    pub fn schema_text(&self) -> &str {
        &self.schema_text
    }

    /// SHA-256 over policy and schema text, hex encoded.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// SHA-256 of policy and schema text, separated so that moving bytes
/// between the two changes the digest.
pub fn bundle_digest(policy_text: &str, schema_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((policy_text.len() as u64).to_be_bytes());
    hasher.update(policy_text.as_bytes());
    hasher.update(schema_text.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// A typed entity with its attribute facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub id: String,
    #[serde(default)]
    pub facts: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            facts: serde_json::Map::new(),
        }
    }

    /// Add a fact (builder pattern).
    pub fn with_fact(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.facts.insert(key.into(), value);
        self
    }
}

/// Everything an engine needs for one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRequest {
    pub principal: Entity,
    pub action: String,
    pub resource: Entity,
    pub context: serde_json::Map<String, serde_json::Value>,
    pub policy: PolicyBundle,
}

/// A rule that matched, with its raw annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPolicy {
    pub id: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl MatchedPolicy {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_ID.to_string(), id.clone());
        Self { id, annotations }
    }

    /// Add an annotation (builder pattern).
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn is_escalating(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_ESCALATE)
    }

    /// Interpret the annotations as persisted policy metadata.
    pub fn metadata(&self) -> PolicyMetadata {
        let escalate_target = self
            .annotations
            .get(ANNOTATION_ESCALATE)
            .filter(|t| !t.trim().is_empty())
            .cloned();
        let custom = self
            .annotations
            .iter()
            .filter(|(k, _)| {
                !matches!(
                    k.as_str(),
                    ANNOTATION_ID | ANNOTATION_REASON | ANNOTATION_ESCALATE
                )
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        PolicyMetadata {
            id: self.id.clone(),
            description: self
                .annotations
                .get(ANNOTATION_REASON)
                .cloned()
                .unwrap_or_default(),
            escalate: self.is_escalating(),
            escalate_target,
            custom,
        }
    }
}

/// Raw per-call engine output, in rule order. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMatchResult {
    pub forbids: Vec<MatchedPolicy>,
    pub permits: Vec<MatchedPolicy>,
}

impl PolicyMatchResult {
    pub fn is_empty(&self) -> bool {
        self.forbids.is_empty() && self.permits.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// Deterministic rule evaluator.
///
/// Identical policy text, schema text and facts must always yield an
/// identical match result. Implementations have no side effects visible
/// to the harness.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluate one request. Malformed policy or schema input, and actions
    /// or resource types the schema does not declare, fail the whole call.
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<PolicyMatchResult, PolicyError>;

    /// Check policy text against schema text without evaluating anything.
    /// An empty list means the pair is acceptable; warnings may be present
    /// on an acceptable pair.
    fn validate(&self, policy_text: &str, schema_text: &str) -> Vec<PolicyIssue>;
}
