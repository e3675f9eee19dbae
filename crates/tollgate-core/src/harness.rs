//! The harness: lifecycle and read operations over one store and one
//! policy bundle.
//!
//! A [`Harness`] is constructed explicitly with its store and torn down by
//! dropping it; nothing is shared between harnesses implicitly.
//!
//! Adjudication order for one step:
//!
//! 1. become the trajectory's writer ([`WriterRegistry`])
//! 2. read the header and check a step may be appended
//! 3. evaluate the step's facts through the [`PolicyGateway`]
//! 4. resolve the match result into a [`Disposition`]
//! 5. append step and advanced header in one store write ([`StepRecorder`])
//!
//! Nothing is written before step 5, so an evaluation error, a timeout or a
//! dropped future leaves the trajectory exactly as it was.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tollgate_state::{
    Agent, Content, Decision, Disposition, Page, PolicyMode, Role, Stage, Step, Trajectory,
    TrajectoryFilter, TrajectoryHeader, TrajectoryId, TrajectoryStatus, TrajectoryStore,
};
use tracing::{debug, warn, Instrument};

use crate::analytics::{self, AnalyticsFilter, AnalyticsReport, Metric};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::facts::evaluation_request;
use crate::lifecycle::{Outcome, TrajectoryStateMachine};
use crate::metrics::METRICS;
use crate::obs;
use crate::policy::{PolicyBundle, PolicyEngine, PolicyError, PolicyGateway, RuleSetEngine};
use crate::recorder::{StepInput, StepRecorder};
use crate::resolver::resolve;
use crate::writer::WriterRegistry;

/// Trajectory metadata key holding the policy bundle digest.
pub const META_POLICY_DIGEST: &str = "policy_digest";
/// Trajectory metadata key holding the policy mode at initialize.
pub const META_POLICY_MODE: &str = "policy_mode";

/// Result of adjudicating one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjudication {
    /// The committed step, carrying the disposition the policies produced.
    pub step: Step,
    /// What the caller should act on. Equals the step's disposition in
    /// govern mode; always Allow in monitor mode.
    pub disposition: Disposition,
}

pub struct Harness {
    store: Arc<dyn TrajectoryStore>,
    gateway: PolicyGateway,
    policy: PolicyBundle,
    config: HarnessConfig,
    machine: TrajectoryStateMachine,
    writers: WriterRegistry,
    recorder: StepRecorder,
}

impl Harness {
    /// Build a harness. Fails with `Configuration` on invalid settings and
    /// with `PolicySyntax` / `SchemaMismatch` if the bundle does not
    /// validate; nothing is accepted partially.
    pub fn new(
        store: Arc<dyn TrajectoryStore>,
        engine: Arc<dyn PolicyEngine>,
        policy: PolicyBundle,
        config: HarnessConfig,
    ) -> HarnessResult<Self> {
        config.validate()?;

        let gateway = PolicyGateway::new(engine).with_timeout(config.evaluation_timeout);
        let (errors, warnings): (Vec<_>, Vec<_>) = gateway
            .validate(policy.policy_text(), policy.schema_text())
            .into_iter()
            .partition(|issue| issue.is_error());
        for issue in &warnings {
            warn!(issue = %issue, "policy warning");
        }
        if !errors.is_empty() {
            return Err(PolicyError::from_issues(errors).into());
        }

        let machine = TrajectoryStateMachine::new(config.stale_after);
        let writers = WriterRegistry::new(config.writer_policy);
        let recorder = StepRecorder::new(store.clone(), machine);
        debug!(
            backend = store.backend_name(),
            digest = policy.digest(),
            mode = %config.mode,
            "harness ready"
        );

        Ok(Self {
            store,
            gateway,
            policy,
            config,
            machine,
            writers,
            recorder,
        })
    }

    /// Harness on the built-in rule-set engine.
    pub fn with_rule_engine(
        store: Arc<dyn TrajectoryStore>,
        policy: PolicyBundle,
        config: HarnessConfig,
    ) -> HarnessResult<Self> {
        Self::new(store, Arc::new(RuleSetEngine::new()), policy, config)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn policy(&self) -> &PolicyBundle {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn TrajectoryStore> {
        &self.store
    }

    /// Trajectories this harness is currently writing or waiting to write.
    pub fn active_writers(&self) -> usize {
        self.writers.tracked()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register `agent` (first registration wins) and open a Pending
    /// trajectory for it.
    pub async fn initialize(&self, agent: &Agent) -> HarnessResult<TrajectoryId> {
        if agent.id.trim().is_empty() {
            return Err(HarnessError::InvalidAgent("agent id is empty".to_string()));
        }
        if agent.provider_id.trim().is_empty() {
            return Err(HarnessError::InvalidAgent(format!(
                "agent {} has no provider id",
                agent.id
            )));
        }

        if !self.store.put_agent(agent).await? {
            debug!(agent_id = %agent.id, "agent already registered");
        }

        let mut header = self.machine.create(&agent.id, Utc::now());
        header.metadata.insert(
            META_POLICY_DIGEST.to_string(),
            serde_json::Value::String(self.policy.digest().to_string()),
        );
        header.metadata.insert(
            META_POLICY_MODE.to_string(),
            serde_json::Value::String(self.config.mode.to_string()),
        );
        if let Err(e) = self.store.create(&header).await {
            obs::emit_storage_error(header.id.as_str(), "create", &e);
            return Err(e.into());
        }

        obs::emit_trajectory_initialized(header.id.as_str(), &agent.id, self.config.mode);
        Ok(header.id)
    }

    /// Adjudicate one step and return the disposition to act on.
    pub async fn adjudicate(
        &self,
        trajectory_id: &TrajectoryId,
        stage: Stage,
        role: Role,
        content: Content,
    ) -> HarnessResult<Disposition> {
        self.adjudicate_step(trajectory_id, StepInput::new(stage, role, content))
            .await
            .map(|a| a.disposition)
    }

    /// Adjudicate one step, returning the committed step as well.
    pub async fn adjudicate_step(
        &self,
        trajectory_id: &TrajectoryId,
        input: StepInput,
    ) -> HarnessResult<Adjudication> {
        self.adjudicate_as_writer(trajectory_id, input)
            .instrument(obs::trajectory_span(trajectory_id.as_str()))
            .await
    }

    async fn adjudicate_as_writer(
        &self,
        trajectory_id: &TrajectoryId,
        input: StepInput,
    ) -> HarnessResult<Adjudication> {
        let _writer = self.writers.acquire(trajectory_id).await?;

        let header = self.store.header(trajectory_id).await?;
        self.machine.check_appendable(&header)?;
        let agent = self.store.get_agent(&header.agent_id).await?;

        let seq = StepRecorder::next_seq(&header);
        let request = evaluation_request(
            &agent,
            &header,
            seq,
            input.stage,
            input.role,
            &input.content,
            &self.policy,
        );
        let matched = self.gateway.evaluate(&request).await?;
        let disposition = resolve(&matched);

        let mode = self.config.mode;
        let stage = input.stage;
        let (_, step) = self
            .recorder
            .record(&header, input, mode, disposition.clone(), Utc::now())
            .await?;

        METRICS.inc_adjudications();
        match disposition.decision {
            Decision::Deny => METRICS.inc_denials(),
            Decision::Escalate => METRICS.inc_escalations(),
            Decision::Allow => {}
        }
        obs::emit_step_adjudicated(
            trajectory_id.as_str(),
            step.seq,
            stage,
            disposition.decision,
            mode,
        );

        let disposition = match mode {
            PolicyMode::Govern => disposition,
            PolicyMode::Monitor => monitored(disposition),
        };
        Ok(Adjudication { step, disposition })
    }

    /// Running → Suspended.
    pub async fn suspend(&self, trajectory_id: &TrajectoryId) -> HarnessResult<()> {
        async {
            let _writer = self.writers.acquire(trajectory_id).await?;

            let header = self.store.header(trajectory_id).await?;
            let next = self.machine.suspend(&header, Utc::now())?;
            self.write_header(&next, header.status, "suspend").await?;

            obs::emit_trajectory_suspended(trajectory_id.as_str(), next.step_count);
            Ok(())
        }
        .instrument(obs::trajectory_span(trajectory_id.as_str()))
        .await
    }

    /// Resume a Suspended (or stale Running) trajectory as `agent_id`.
    /// Later steps continue the existing sequence.
    pub async fn resume(&self, trajectory_id: &TrajectoryId, agent_id: &str) -> HarnessResult<()> {
        async {
            let _writer = self.writers.acquire(trajectory_id).await?;

            let header = self.store.header(trajectory_id).await?;
            let next = self.machine.resume(&header, agent_id, Utc::now())?;
            self.write_header(&next, header.status, "resume").await?;

            obs::emit_trajectory_resumed(trajectory_id.as_str(), header.status, next.step_count);
            Ok(())
        }
        .instrument(obs::trajectory_span(trajectory_id.as_str()))
        .await
    }

    /// Close the trajectory with `outcome`. No step may follow.
    pub async fn finalize(&self, trajectory_id: &TrajectoryId, outcome: Outcome) -> HarnessResult<()> {
        async {
            let _writer = self.writers.acquire(trajectory_id).await?;

            let header = self.store.header(trajectory_id).await?;
            let next = self.machine.finalize(&header, outcome, Utc::now())?;
            self.write_header(&next, header.status, "finalize").await?;

            obs::emit_trajectory_finalized(
                trajectory_id.as_str(),
                next.status,
                next.step_count,
                next.duration_seconds(),
            );
            Ok(())
        }
        .instrument(obs::trajectory_span(trajectory_id.as_str()))
        .await
    }

    /// Set an out-of-band metadata tag. Allowed in every status, including
    /// after finalize. A write from another session landing between the
    /// read and the write reports `WriterConflict`; nothing is overwritten.
    pub async fn tag(
        &self,
        trajectory_id: &TrajectoryId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> HarnessResult<()> {
        let _writer = self.writers.acquire(trajectory_id).await?;

        let header = self.store.header(trajectory_id).await?;
        let mut next = header.next_revision();
        next.metadata.insert(key.into(), value);
        self.write_header(&next, header.status, "tag").await
    }

    async fn write_header(
        &self,
        header: &TrajectoryHeader,
        expected: TrajectoryStatus,
        operation: &str,
    ) -> HarnessResult<()> {
        if let Err(e) = self.store.update_header(header, expected).await {
            obs::emit_storage_error(header.id.as_str(), operation, &e);
            return Err(e.into());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Full trajectory with every step and disposition.
    pub async fn get(&self, trajectory_id: &TrajectoryId) -> HarnessResult<Trajectory> {
        Ok(self.store.get(trajectory_id).await?)
    }

    /// Trajectory headers, creation order. `page_size` of `None` or 0 uses
    /// the configured default; larger sizes are clamped to the maximum.
    pub async fn list(
        &self,
        filter: &TrajectoryFilter,
        page_size: Option<usize>,
        page_token: Option<&str>,
    ) -> HarnessResult<Page<TrajectoryHeader>> {
        let page_size = self.config.page_size(page_size);
        Ok(self.store.list(filter, page_size, page_token).await?)
    }

    pub async fn list_agents(
        &self,
        provider_id: Option<&str>,
        page_size: Option<usize>,
        page_token: Option<&str>,
    ) -> HarnessResult<Page<Agent>> {
        let page_size = self.config.page_size(page_size);
        Ok(self
            .store
            .list_agents(provider_id, page_size, page_token)
            .await?)
    }

    /// Streaming rollup of `metrics` (all metrics when empty).
    pub async fn aggregate(
        &self,
        filter: &AnalyticsFilter,
        metrics: &[Metric],
    ) -> HarnessResult<AnalyticsReport> {
        analytics::aggregate(
            self.store.as_ref(),
            filter,
            metrics,
            self.config.default_page_size,
            self.config.top_n,
        )
        .await
    }
}

/// Caller-facing disposition in monitor mode.
fn monitored(observed: Disposition) -> Disposition {
    Disposition {
        decision: Decision::Allow,
        reason: format!(
            "monitor mode: would {}: {}",
            observed.decision, observed.reason
        ),
        policies: observed.policies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_state::MemoryTrajectoryStore;

    const SCHEMA: &str = r#"{
        "entity_types": ["Agent", "Trajectory", "Message"],
        "actions": {"Prompt": {"resource_types": ["Message"]}}
    }"#;

    fn harness(policy: &str) -> HarnessResult<Harness> {
        Harness::with_rule_engine(
            Arc::new(MemoryTrajectoryStore::new()),
            PolicyBundle::new(policy, SCHEMA),
            HarnessConfig::default(),
        )
    }

    #[test]
    fn monitored_reports_the_observed_decision() {
        let d = monitored(Disposition {
            decision: Decision::Deny,
            reason: "denied by no-bash".to_string(),
            policies: Vec::new(),
        });
        assert_eq!(d.decision, Decision::Allow);
        assert_eq!(d.reason, "monitor mode: would deny: denied by no-bash");
    }

    #[test]
    fn invalid_policy_is_rejected_up_front() {
        let err = harness(r#"{"rules": [{"effect": "permit"}]}"#)
            .err()
            .expect("rule without id must be rejected");
        assert!(matches!(err, HarnessError::PolicySyntax(_)), "{err}");
    }

    #[tokio::test]
    async fn initialize_records_digest_and_mode() {
        let harness = harness("").unwrap();
        let id = harness
            .initialize(&Agent::new("a-1", "prov", "bot"))
            .await
            .unwrap();
        let trajectory = harness.get(&id).await.unwrap();
        assert_eq!(trajectory.header.status, TrajectoryStatus::Pending);
        assert!(trajectory.steps.is_empty());
        assert_eq!(
            trajectory.header.metadata[META_POLICY_DIGEST],
            harness.policy().digest()
        );
        assert_eq!(trajectory.header.metadata[META_POLICY_MODE], "govern");
    }

    #[tokio::test]
    async fn initialize_rejects_blank_agent() {
        let harness = harness("").unwrap();
        assert!(matches!(
            harness.initialize(&Agent::new(" ", "prov", "bot")).await,
            Err(HarnessError::InvalidAgent(_))
        ));
        assert!(matches!(
            harness.initialize(&Agent::new("a-1", "", "bot")).await,
            Err(HarnessError::InvalidAgent(_))
        ));
    }

    #[tokio::test]
    async fn tag_after_finalize() {
        let harness = harness("").unwrap();
        let id = harness
            .initialize(&Agent::new("a-1", "prov", "bot"))
            .await
            .unwrap();
        harness.finalize(&id, Outcome::Completed).await.unwrap();
        harness
            .tag(&id, "reviewed", serde_json::json!(true))
            .await
            .unwrap();
        let header = harness.get(&id).await.unwrap().header;
        assert_eq!(header.metadata["reviewed"], true);
        assert_eq!(header.status, TrajectoryStatus::Completed);
    }
}
