//! Streaming rollups over a filtered trajectory set.
//!
//! [`aggregate`] walks the store page by page and folds each trajectory
//! into an [`Aggregator`]; only the current page (and, for step-level
//! metrics, one trajectory's steps) is in memory at a time.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_state::{
    Decision, PolicyMode, Trajectory, TrajectoryFilter, TrajectoryHeader, TrajectoryStatus,
    TrajectoryStore,
};
use tracing::debug;

use crate::error::HarnessResult;

/// Which trajectories to aggregate. Bounds are inclusive on `created_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsFilter {
    pub agent_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AnalyticsFilter {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn matches(&self, header: &TrajectoryHeader) -> bool {
        self.agent_id
            .as_deref()
            .map(|a| header.agent_id == a)
            .unwrap_or(true)
            && self.start_time.map(|s| header.created_at >= s).unwrap_or(true)
            && self.end_time.map(|e| header.created_at <= e).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TrajectoryCount,
    CompletedCount,
    FailedCount,
    /// Governed steps resolved to Deny.
    DeniedCount,
    /// Governed steps resolved to Escalate.
    EscalatedCount,
    StepCount,
    /// Mean of `ended_at - started_at` over finalized trajectories.
    AvgDurationSeconds,
    /// Hard-forbid rules behind governed denials, most frequent first.
    TopDeniedPolicies,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::TrajectoryCount,
        Metric::CompletedCount,
        Metric::FailedCount,
        Metric::DeniedCount,
        Metric::EscalatedCount,
        Metric::StepCount,
        Metric::AvgDurationSeconds,
        Metric::TopDeniedPolicies,
    ];

    /// Whether the metric needs step history rather than headers alone.
    pub fn needs_steps(&self) -> bool {
        matches!(
            self,
            Metric::DeniedCount | Metric::EscalatedCount | Metric::TopDeniedPolicies
        )
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown metric '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedPolicy {
    pub policy_id: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Count(u64),
    /// `None` when nothing qualified (no finalized trajectories).
    Seconds(Option<f64>),
    Ranked(Vec<RankedPolicy>),
}

pub type AnalyticsReport = BTreeMap<Metric, MetricValue>;

/// Running totals. Fold headers (and trajectories when step metrics are
/// wanted) in any order, then [`Aggregator::finish`].
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    trajectories: u64,
    completed: u64,
    failed: u64,
    steps: u64,
    denied: u64,
    escalated: u64,
    duration_sum: f64,
    durations: u64,
    denied_by_policy: HashMap<String, u64>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_header(&mut self, header: &TrajectoryHeader) {
        self.trajectories += 1;
        self.steps += header.step_count;
        match header.status {
            TrajectoryStatus::Completed => self.completed += 1,
            TrajectoryStatus::Failed => self.failed += 1,
            _ => {}
        }
        if let Some(end) = header.ended_at {
            // Finalized without a step: measure from creation.
            let start = header.started_at.unwrap_or(header.created_at);
            self.duration_sum += (end - start).num_milliseconds() as f64 / 1000.0;
            self.durations += 1;
        }
    }

    /// Step-level counters. Monitor-mode steps are ignored.
    pub fn observe_steps(&mut self, trajectory: &Trajectory) {
        let governed = trajectory
            .steps
            .iter()
            .filter(|s| s.mode == PolicyMode::Govern)
            .filter_map(|s| s.disposition.as_ref());
        for disposition in governed {
            match disposition.decision {
                Decision::Deny => {
                    self.denied += 1;
                    for policy in disposition.policies.iter().filter(|p| !p.escalate) {
                        *self.denied_by_policy.entry(policy.id.clone()).or_default() += 1;
                    }
                }
                Decision::Escalate => self.escalated += 1,
                Decision::Allow => {}
            }
        }
    }

    pub fn finish(&self, metrics: &[Metric], top_n: usize) -> AnalyticsReport {
        let requested: BTreeSet<Metric> = metrics.iter().copied().collect();
        requested
            .into_iter()
            .map(|metric| {
                let value = match metric {
                    Metric::TrajectoryCount => MetricValue::Count(self.trajectories),
                    Metric::CompletedCount => MetricValue::Count(self.completed),
                    Metric::FailedCount => MetricValue::Count(self.failed),
                    Metric::DeniedCount => MetricValue::Count(self.denied),
                    Metric::EscalatedCount => MetricValue::Count(self.escalated),
                    Metric::StepCount => MetricValue::Count(self.steps),
                    Metric::AvgDurationSeconds => MetricValue::Seconds(
                        (self.durations > 0).then(|| self.duration_sum / self.durations as f64),
                    ),
                    Metric::TopDeniedPolicies => MetricValue::Ranked(self.ranked(top_n)),
                };
                (metric, value)
            })
            .collect()
    }

    /// Count descending, then policy id ascending.
    fn ranked(&self, top_n: usize) -> Vec<RankedPolicy> {
        let mut ranked: Vec<RankedPolicy> = self
            .denied_by_policy
            .iter()
            .map(|(id, count)| RankedPolicy {
                policy_id: id.clone(),
                count: *count,
            })
            .collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.policy_id.cmp(&b.policy_id)));
        ranked.truncate(top_n);
        ranked
    }
}

/// Aggregate `metrics` over trajectories matching `filter`.
///
/// Fails with `HistoryUnavailable` on stores that keep no history.
pub async fn aggregate(
    store: &dyn TrajectoryStore,
    filter: &AnalyticsFilter,
    metrics: &[Metric],
    page_size: usize,
    top_n: usize,
) -> HarnessResult<AnalyticsReport> {
    let metrics: Vec<Metric> = if metrics.is_empty() {
        Metric::ALL.to_vec()
    } else {
        metrics.to_vec()
    };
    let needs_steps = metrics.iter().any(Metric::needs_steps);
    let store_filter = TrajectoryFilter {
        agent_id: filter.agent_id.clone(),
        status: None,
    };

    let mut aggregator = Aggregator::new();
    let mut token: Option<String> = None;
    let mut pages = 0u64;
    loop {
        let page = store.list(&store_filter, page_size, token.as_deref()).await?;
        pages += 1;
        for header in page.items.iter().filter(|h| filter.matches(h)) {
            aggregator.observe_header(header);
            if needs_steps && header.step_count > 0 {
                let trajectory = store.get(&header.id).await?;
                aggregator.observe_steps(&trajectory);
            }
        }
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    debug!(pages, trajectories = aggregator.trajectories, "aggregation complete");

    Ok(aggregator.finish(&metrics, top_n))
}
