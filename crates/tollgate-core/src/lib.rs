//! Tollgate Core Library
//!
//! Policy adjudication for agent action points: every step an agent takes
//! is evaluated against a policy bundle, resolved to allow, deny or
//! escalate, and recorded in an append-only trajectory.
//!
//! Start with [`Harness`]; everything else is exposed for embedding and
//! testing.

pub mod analytics;
pub mod config;
pub mod error;
pub mod facts;
pub mod harness;
pub mod lifecycle;
pub mod metrics;
pub mod obs;
pub mod policy;
pub mod recorder;
pub mod resolver;
pub mod telemetry;
pub mod writer;

pub use analytics::{
    aggregate, Aggregator, AnalyticsFilter, AnalyticsReport, Metric, MetricValue, RankedPolicy,
};
pub use config::{HarnessConfig, WriterPolicy};
pub use error::{HarnessError, HarnessResult};
pub use harness::{Adjudication, Harness, META_POLICY_DIGEST, META_POLICY_MODE};
pub use lifecycle::{Outcome, TrajectoryStateMachine};
pub use policy::{
    EvaluationRequest, MatchedPolicy, PolicyBundle, PolicyEngine, PolicyError, PolicyGateway,
    PolicyIssue, PolicyMatchResult, PolicySchema, RuleSet, RuleSetEngine,
};
pub use recorder::{StepInput, StepRecorder};
pub use resolver::resolve;
pub use writer::{WriterGuard, WriterRegistry};

pub use tollgate_state::{
    Agent, Content, Decision, Disposition, Page, PolicyMetadata, PolicyMode, Role, Stage, Step,
    Tool, Trajectory, TrajectoryFilter, TrajectoryHeader, TrajectoryId, TrajectoryStatus,
    TrajectoryStore,
};

pub use metrics::METRICS;
pub use obs::{
    emit_step_adjudicated, emit_storage_error, emit_trajectory_finalized,
    emit_trajectory_initialized, emit_trajectory_resumed, emit_trajectory_suspended,
    TrajectorySpan,
};
pub use telemetry::init_tracing;

/// Tollgate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
