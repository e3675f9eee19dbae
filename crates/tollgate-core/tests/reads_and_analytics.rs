//! Listing, analytics and history-less deployments through the harness.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tollgate_core::{
    Agent, AnalyticsFilter, Content, Decision, Harness, HarnessConfig, HarnessError, Metric,
    MetricValue, Outcome, PolicyBundle, PolicySchema, RankedPolicy, Role, Stage, Tool,
    TrajectoryFilter, TrajectoryStatus, TrajectoryStore,
};
use tollgate_state::{EphemeralTrajectoryStore, MemoryTrajectoryStore, SurrealTrajectoryStore};

fn agent(id: &str) -> Agent {
    Agent::new(id, "acme", "ops-bot")
        .with_tool(Tool::new("Bash", "run a shell command"))
        .with_tool(Tool::new("Transfer", "move money between accounts"))
}

fn policy() -> PolicyBundle {
    let rules = json!({"rules": [
        {"effect": "forbid", "actions": ["Bash"],
         "annotations": {"id": "no-bash", "reason": "shell access is disabled"}},
        {"effect": "forbid", "actions": ["Transfer"],
         "when": [{"fact": "context.parameters.amount", "op": "gt", "value": 10000}],
         "annotations": {"id": "large-transfer", "escalate": "finance"}},
        {"effect": "forbid", "actions": ["Transfer"],
         "when": [{"fact": "context.parameters.currency", "op": "eq", "value": "XMR"}],
         "annotations": {"id": "no-privacy-coins"}},
        {"effect": "permit", "annotations": {"id": "allow-all"}}
    ]});
    PolicyBundle::new(
        rules.to_string(),
        PolicySchema::for_agent(&agent("any")).to_json_pretty(),
    )
}

fn harness(store: Arc<dyn TrajectoryStore>, config: HarnessConfig) -> Harness {
    Harness::with_rule_engine(store, policy(), config).unwrap()
}

fn bash() -> Content {
    Content::tool_request("Bash", json!({"command": "ls"}))
}

fn transfer(amount: u64, currency: &str) -> Content {
    Content::tool_request("Transfer", json!({"amount": amount, "currency": currency}))
}

async fn step(harness: &Harness, id: &tollgate_core::TrajectoryId, content: Content) -> Decision {
    harness
        .adjudicate(id, Stage::PreTool, Role::Model, content)
        .await
        .unwrap()
        .decision
}

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_pages_through_every_trajectory_once() {
    let harness = harness(
        Arc::new(MemoryTrajectoryStore::new()),
        HarnessConfig::default(),
    );
    let mut created = Vec::new();
    for _ in 0..7 {
        created.push(harness.initialize(&agent("agent-1")).await.unwrap());
    }

    let filter = TrajectoryFilter::default();
    let mut seen = Vec::new();
    let mut sizes = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = harness
            .list(&filter, Some(3), token.as_deref())
            .await
            .unwrap();
        sizes.push(page.items.len());
        seen.extend(page.items.into_iter().map(|h| h.id));
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    assert_eq!(sizes, vec![3, 3, 1]);
    assert_eq!(seen.len(), 7);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 7);
    assert_eq!(
        seen.iter().collect::<HashSet<_>>(),
        created.iter().collect::<HashSet<_>>()
    );
}

#[tokio::test]
async fn page_size_defaults_and_clamps() {
    let harness = harness(
        Arc::new(MemoryTrajectoryStore::new()),
        HarnessConfig::default().with_page_sizes(2, 4),
    );
    for _ in 0..6 {
        harness.initialize(&agent("agent-1")).await.unwrap();
    }
    let filter = TrajectoryFilter::default();
    assert_eq!(harness.list(&filter, None, None).await.unwrap().items.len(), 2);
    assert_eq!(
        harness.list(&filter, Some(100), None).await.unwrap().items.len(),
        4
    );
}

#[tokio::test]
async fn list_filters_by_agent_and_status() {
    let harness = harness(
        Arc::new(MemoryTrajectoryStore::new()),
        HarnessConfig::default(),
    );
    let done = harness.initialize(&agent("agent-1")).await.unwrap();
    harness.initialize(&agent("agent-1")).await.unwrap();
    harness.initialize(&agent("agent-2")).await.unwrap();
    harness.finalize(&done, Outcome::Completed).await.unwrap();

    let mine = harness
        .list(&TrajectoryFilter::for_agent("agent-1"), None, None)
        .await
        .unwrap();
    assert_eq!(mine.items.len(), 2);

    let completed = harness
        .list(
            &TrajectoryFilter::for_agent("agent-1").with_status(TrajectoryStatus::Completed),
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(completed.items.len(), 1);
    assert_eq!(completed.items[0].id, done);

    let agents = harness.list_agents(Some("acme"), None, None).await.unwrap();
    let ids: Vec<_> = agents.items.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["agent-1", "agent-2"]);
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aggregate_rolls_up_outcomes_and_denials() {
    let harness = harness(
        Arc::new(MemoryTrajectoryStore::new()),
        HarnessConfig::default().with_page_sizes(2, 10),
    );

    let t1 = harness.initialize(&agent("agent-1")).await.unwrap();
    assert_eq!(step(&harness, &t1, bash()).await, Decision::Deny);
    assert_eq!(step(&harness, &t1, transfer(10, "EUR")).await, Decision::Allow);
    harness.finalize(&t1, Outcome::Completed).await.unwrap();

    let t2 = harness.initialize(&agent("agent-1")).await.unwrap();
    assert_eq!(step(&harness, &t2, bash()).await, Decision::Deny);
    assert_eq!(step(&harness, &t2, transfer(5, "XMR")).await, Decision::Deny);
    harness.finalize(&t2, Outcome::Failed).await.unwrap();

    let t3 = harness.initialize(&agent("agent-2")).await.unwrap();
    assert_eq!(
        step(&harness, &t3, transfer(20_000, "EUR")).await,
        Decision::Escalate
    );

    harness.initialize(&agent("agent-2")).await.unwrap();

    let report = harness
        .aggregate(&AnalyticsFilter::default(), &[])
        .await
        .unwrap();
    assert_eq!(report[&Metric::TrajectoryCount], MetricValue::Count(4));
    assert_eq!(report[&Metric::CompletedCount], MetricValue::Count(1));
    assert_eq!(report[&Metric::FailedCount], MetricValue::Count(1));
    assert_eq!(report[&Metric::DeniedCount], MetricValue::Count(3));
    assert_eq!(report[&Metric::EscalatedCount], MetricValue::Count(1));
    assert_eq!(report[&Metric::StepCount], MetricValue::Count(5));
    assert_eq!(
        report[&Metric::TopDeniedPolicies],
        MetricValue::Ranked(vec![
            RankedPolicy {
                policy_id: "no-bash".to_string(),
                count: 2
            },
            RankedPolicy {
                policy_id: "no-privacy-coins".to_string(),
                count: 1
            },
        ])
    );
    match &report[&Metric::AvgDurationSeconds] {
        MetricValue::Seconds(Some(avg)) => assert!(*avg >= 0.0),
        other => panic!("expected an average, got {other:?}"),
    }

    let agent_two = harness
        .aggregate(
            &AnalyticsFilter::for_agent("agent-2"),
            &[Metric::TrajectoryCount, Metric::AvgDurationSeconds],
        )
        .await
        .unwrap();
    assert_eq!(agent_two.len(), 2);
    assert_eq!(agent_two[&Metric::TrajectoryCount], MetricValue::Count(2));
    assert_eq!(agent_two[&Metric::AvgDurationSeconds], MetricValue::Seconds(None));
}

#[tokio::test]
async fn aggregate_respects_the_time_window() {
    let harness = harness(
        Arc::new(MemoryTrajectoryStore::new()),
        HarnessConfig::default(),
    );
    harness.initialize(&agent("agent-1")).await.unwrap();
    let now = Utc::now();

    let past = AnalyticsFilter::default().between(now - Duration::hours(1), now);
    let future = AnalyticsFilter::default().between(now + Duration::hours(1), now + Duration::hours(2));

    let report = harness
        .aggregate(&past, &[Metric::TrajectoryCount])
        .await
        .unwrap();
    assert_eq!(report[&Metric::TrajectoryCount], MetricValue::Count(1));

    let report = harness
        .aggregate(&future, &[Metric::TrajectoryCount])
        .await
        .unwrap();
    assert_eq!(report[&Metric::TrajectoryCount], MetricValue::Count(0));
}

#[tokio::test]
async fn top_denied_is_truncated_to_top_n() {
    let harness = harness(
        Arc::new(MemoryTrajectoryStore::new()),
        HarnessConfig::default().with_top_n(1),
    );
    let id = harness.initialize(&agent("agent-1")).await.unwrap();
    step(&harness, &id, transfer(1, "XMR")).await;
    step(&harness, &id, bash()).await;
    step(&harness, &id, bash()).await;

    let report = harness
        .aggregate(&AnalyticsFilter::default(), &[Metric::TopDeniedPolicies])
        .await
        .unwrap();
    assert_eq!(
        report[&Metric::TopDeniedPolicies],
        MetricValue::Ranked(vec![RankedPolicy {
            policy_id: "no-bash".to_string(),
            count: 2
        }])
    );
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_less_store_reports_unavailable() {
    let harness = harness(
        Arc::new(EphemeralTrajectoryStore::new()),
        HarnessConfig::default(),
    );
    let id = harness.initialize(&agent("agent-1")).await.unwrap();

    // Lifecycle keeps working.
    assert_eq!(step(&harness, &id, bash()).await, Decision::Deny);
    harness.finalize(&id, Outcome::Completed).await.unwrap();

    assert!(matches!(
        harness.get(&id).await,
        Err(HarnessError::HistoryUnavailable { .. })
    ));
    assert!(matches!(
        harness.list(&TrajectoryFilter::default(), None, None).await,
        Err(HarnessError::HistoryUnavailable { .. })
    ));
    assert!(matches!(
        harness.aggregate(&AnalyticsFilter::default(), &[]).await,
        Err(HarnessError::HistoryUnavailable { .. })
    ));
}

#[tokio::test]
async fn surreal_backed_harness_end_to_end() {
    let store = SurrealTrajectoryStore::in_memory().await.unwrap();
    let harness = harness(Arc::new(store), HarnessConfig::default());

    let id = harness.initialize(&agent("agent-1")).await.unwrap();
    assert_eq!(step(&harness, &id, bash()).await, Decision::Deny);
    assert_eq!(
        step(&harness, &id, transfer(20_000, "EUR")).await,
        Decision::Escalate
    );
    harness.suspend(&id).await.unwrap();
    harness.resume(&id, "agent-1").await.unwrap();
    assert_eq!(step(&harness, &id, transfer(1, "EUR")).await, Decision::Allow);
    harness.finalize(&id, Outcome::Completed).await.unwrap();

    let trajectory = harness.get(&id).await.unwrap();
    let seqs: Vec<_> = trajectory.steps.iter().map(|s| s.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(trajectory.header.status, TrajectoryStatus::Completed);
    assert_eq!(
        trajectory.steps[1]
            .disposition
            .as_ref()
            .and_then(|d| d.escalate_target()),
        Some("finance")
    );

    let report = harness
        .aggregate(&AnalyticsFilter::for_agent("agent-1"), &[Metric::DeniedCount])
        .await
        .unwrap();
    assert_eq!(report[&Metric::DeniedCount], MetricValue::Count(1));
}
