//! Behavioral contract tests for TrajectoryStore.
//!
//! Every contract runs against the in-memory store and the SurrealDB store
//! (`mem://`). The ephemeral store gets its own history tests at the end.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tollgate_state::storage_traits::*;
use tollgate_state::{
    Agent, Content, EphemeralTrajectoryStore, MemoryTrajectoryStore, PolicyMode, Role, Stage,
    Step, StorageError, SurrealTrajectoryStore, Tool, TrajectoryHeader, TrajectoryStatus,
};

// ===========================================================================
// Helpers
// ===========================================================================

fn agent(id: &str, provider: &str) -> Agent {
    Agent::new(id, provider, format!("{id} agent"))
        .with_tool(Tool::new("Bash", "Run a shell command").with_parameter("command", "", "string"))
}

fn step(seq: u64) -> Step {
    Step {
        seq,
        stage: Stage::PreModel,
        role: Role::User,
        content: Content::prompt(format!("message {seq}")),
        created_at: Utc::now(),
        snapshot: None,
        mode: PolicyMode::Govern,
        disposition: None,
    }
}

/// Header + step for the next append, as the recorder would build them.
fn next(header: &TrajectoryHeader) -> (TrajectoryHeader, Step) {
    let mut updated = header.next_revision();
    let step = step(header.step_count + 1);
    updated.step_count = step.seq;
    updated.status = TrajectoryStatus::Running;
    updated.updated_at = Utc::now();
    (updated, step)
}

async fn surreal() -> SurrealTrajectoryStore {
    SurrealTrajectoryStore::in_memory().await.unwrap()
}

// ===========================================================================
// Contracts
// ===========================================================================

async fn contract_agent_registration(store: &dyn TrajectoryStore) {
    assert!(store.put_agent(&agent("a-1", "p-1")).await.unwrap());

    let mut renamed = agent("a-1", "p-1");
    renamed.name = "impostor".to_string();
    assert!(!store.put_agent(&renamed).await.unwrap());

    let stored = store.get_agent("a-1").await.unwrap();
    assert_eq!(stored.name, "a-1 agent");
    assert_eq!(stored.tools.len(), 1);

    let err = store.get_agent("missing").await.unwrap_err();
    assert!(matches!(err, StorageError::AgentNotFound { .. }));
}

async fn contract_append_is_contiguous(store: &dyn TrajectoryStore) {
    let header = TrajectoryHeader::new("a-1", Utc::now());
    store.create(&header).await.unwrap();

    let mut current = header;
    for _ in 0..3 {
        let (updated, step) = next(&current);
        store.append_step(&updated, &step).await.unwrap();
        current = updated;
    }

    let trajectory = store.get(&current.id).await.unwrap();
    let seqs: Vec<u64> = trajectory.steps.iter().map(|s| s.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(trajectory.header.step_count, 3);
    assert_eq!(trajectory.header.status, TrajectoryStatus::Running);
}

async fn contract_append_rejects_stale_seq(store: &dyn TrajectoryStore) {
    let header = TrajectoryHeader::new("a-1", Utc::now());
    store.create(&header).await.unwrap();

    let (updated, first) = next(&header);
    store.append_step(&updated, &first).await.unwrap();

    // A second writer that read the old header loses.
    let err = store.append_step(&updated, &first).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::SequenceConflict {
            expected: 2,
            actual: 1,
            ..
        }
    ));

    let trajectory = store.get(&header.id).await.unwrap();
    assert_eq!(trajectory.steps.len(), 1);
}

async fn contract_terminal_rejects_append(store: &dyn TrajectoryStore) {
    let header = TrajectoryHeader::new("a-1", Utc::now());
    store.create(&header).await.unwrap();

    let mut done = header.next_revision();
    done.status = TrajectoryStatus::Completed;
    done.ended_at = Some(Utc::now());
    store
        .update_header(&done, TrajectoryStatus::Pending)
        .await
        .unwrap();

    let (updated, step) = next(&done);
    let err = store.append_step(&updated, &step).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::InvalidTrajectoryState {
            status: TrajectoryStatus::Completed,
            ..
        }
    ));
}

async fn contract_update_is_status_guarded(store: &dyn TrajectoryStore) {
    let header = TrajectoryHeader::new("a-1", Utc::now());
    store.create(&header).await.unwrap();

    let mut suspended = header.next_revision();
    suspended.status = TrajectoryStatus::Suspended;
    let err = store
        .update_header(&suspended, TrajectoryStatus::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::StatusConflict { .. }));
    assert_eq!(
        store.header(&header.id).await.unwrap().status,
        TrajectoryStatus::Pending
    );

    // Tags survive on terminal trajectories.
    let mut failed = header.next_revision();
    failed.status = TrajectoryStatus::Failed;
    store
        .update_header(&failed, TrajectoryStatus::Pending)
        .await
        .unwrap();
    let mut tagged = failed.next_revision();
    tagged
        .metadata
        .insert("reviewed".to_string(), serde_json::json!(true));
    store
        .update_header(&tagged, TrajectoryStatus::Failed)
        .await
        .unwrap();
    let stored = store.header(&header.id).await.unwrap();
    assert_eq!(stored.metadata["reviewed"], serde_json::json!(true));
    assert_eq!(stored.revision, 2);
}

async fn contract_update_from_stale_read_loses(store: &dyn TrajectoryStore) {
    let header = TrajectoryHeader::new("a-1", Utc::now());
    store.create(&header).await.unwrap();

    // Two sessions read the same header and tag different keys.
    let read = store.header(&header.id).await.unwrap();
    let mut reviewer = read.next_revision();
    reviewer
        .metadata
        .insert("reviewer".to_string(), serde_json::json!("ana"));
    let mut ticket = read.next_revision();
    ticket
        .metadata
        .insert("ticket".to_string(), serde_json::json!("OPS-7"));

    store
        .update_header(&reviewer, TrajectoryStatus::Pending)
        .await
        .unwrap();
    let err = store
        .update_header(&ticket, TrajectoryStatus::Pending)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::RevisionConflict {
            expected: 2,
            actual: 1,
            ..
        }
    ));

    let stored = store.header(&header.id).await.unwrap();
    assert_eq!(stored.metadata["reviewer"], serde_json::json!("ana"));
    assert!(!stored.metadata.contains_key("ticket"));

    // An append built from the stale read loses the same way.
    let (updated, step) = next(&read);
    assert!(matches!(
        store.append_step(&updated, &step).await.unwrap_err(),
        StorageError::RevisionConflict { .. }
    ));
}

async fn contract_duplicate_create(store: &dyn TrajectoryStore) {
    let header = TrajectoryHeader::new("a-1", Utc::now());
    store.create(&header).await.unwrap();
    let err = store.create(&header).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateTrajectory { .. }));
}

async fn contract_missing_trajectory(store: &dyn TrajectoryStore) {
    let header = TrajectoryHeader::new("a-1", Utc::now());
    assert!(matches!(
        store.header(&header.id).await.unwrap_err(),
        StorageError::TrajectoryNotFound { .. }
    ));
    assert!(matches!(
        store.get(&header.id).await.unwrap_err(),
        StorageError::TrajectoryNotFound { .. }
    ));
}

async fn contract_paging_covers_everything_once(store: &dyn TrajectoryStore) {
    let base = Utc::now();
    let mut expected = Vec::new();
    for i in 0..7 {
        // Two trajectories share each timestamp to exercise the id tie-break.
        let header = TrajectoryHeader::new("pager", base + Duration::milliseconds(i / 2));
        store.create(&header).await.unwrap();
        expected.push(header.id.clone());
    }

    let filter = TrajectoryFilter::for_agent("pager");
    let mut seen = Vec::new();
    let mut token: Option<String> = None;
    let mut pages = 0;
    loop {
        let page = store.list(&filter, 3, token.as_deref()).await.unwrap();
        assert!(page.items.len() <= 3);
        seen.extend(page.items.iter().map(|h| h.id.clone()));
        pages += 1;
        match page.next_page_token {
            Some(t) => token = Some(t),
            None => break,
        }
    }

    assert_eq!(pages, 3);
    assert_eq!(seen.len(), 7);
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), 7);
    let expected: HashSet<_> = expected.iter().collect();
    assert_eq!(unique, expected);
}

async fn contract_paging_stable_under_inserts(store: &dyn TrajectoryStore) {
    let base = Utc::now();
    for i in 0..4 {
        let header = TrajectoryHeader::new("stable", base + Duration::seconds(i));
        store.create(&header).await.unwrap();
    }

    let filter = TrajectoryFilter::for_agent("stable");
    let first = store.list(&filter, 2, None).await.unwrap();
    let token = first.next_page_token.clone().unwrap();

    // Inserted behind the cursor: must not shift or duplicate anything.
    let early = TrajectoryHeader::new("stable", base - Duration::seconds(10));
    store.create(&early).await.unwrap();

    let second = store.list(&filter, 2, Some(&token)).await.unwrap();
    let mut ids: Vec<_> = first.items.iter().map(|h| h.id.clone()).collect();
    ids.extend(second.items.iter().map(|h| h.id.clone()));
    assert_eq!(ids.len(), 4);
    assert!(!ids.contains(&early.id));
    assert!(second.next_page_token.is_none());
}

async fn contract_status_filter(store: &dyn TrajectoryStore) {
    let a = TrajectoryHeader::new("filtered", Utc::now());
    let b = TrajectoryHeader::new("filtered", Utc::now());
    store.create(&a).await.unwrap();
    store.create(&b).await.unwrap();
    let (updated, step) = next(&b);
    store.append_step(&updated, &step).await.unwrap();

    let filter = TrajectoryFilter::for_agent("filtered").with_status(TrajectoryStatus::Running);
    let page = store.list(&filter, 10, None).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, b.id);
}

async fn contract_list_agents(store: &dyn TrajectoryStore) {
    for (id, provider) in [("ag-1", "p-a"), ("ag-2", "p-b"), ("ag-3", "p-a"), ("ag-4", "p-a")] {
        store.put_agent(&agent(id, provider)).await.unwrap();
    }

    let first = store.list_agents(Some("p-a"), 2, None).await.unwrap();
    let ids: Vec<_> = first.items.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["ag-1", "ag-3"]);

    let token = first.next_page_token.unwrap();
    let second = store
        .list_agents(Some("p-a"), 2, Some(&token))
        .await
        .unwrap();
    let ids: Vec<_> = second.items.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["ag-4"]);
    assert!(second.next_page_token.is_none());

    // Includes "a-1" from the registration contract.
    let all = store.list_agents(None, 10, None).await.unwrap();
    assert_eq!(all.items.len(), 5);
}

async fn contract_huge_page_size(store: &dyn TrajectoryStore) {
    store
        .create(&TrajectoryHeader::new("huge", Utc::now()))
        .await
        .unwrap();
    let page = store
        .list(&TrajectoryFilter::for_agent("huge"), usize::MAX, None)
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert!(page.next_page_token.is_none());
}

async fn contract_bad_token(store: &dyn TrajectoryStore) {
    let err = store
        .list(&TrajectoryFilter::default(), 5, Some("zz-not-a-token"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidPageToken { .. }));
}

async fn run_all(store: &dyn TrajectoryStore) {
    contract_agent_registration(store).await;
    contract_append_is_contiguous(store).await;
    contract_append_rejects_stale_seq(store).await;
    contract_terminal_rejects_append(store).await;
    contract_update_is_status_guarded(store).await;
    contract_update_from_stale_read_loses(store).await;
    contract_duplicate_create(store).await;
    contract_missing_trajectory(store).await;
    contract_paging_covers_everything_once(store).await;
    contract_paging_stable_under_inserts(store).await;
    contract_status_filter(store).await;
    contract_list_agents(store).await;
    contract_huge_page_size(store).await;
    contract_bad_token(store).await;
}

// ===========================================================================
// Backends
// ===========================================================================

#[tokio::test]
async fn memory_store_satisfies_contracts() {
    let store = MemoryTrajectoryStore::new();
    run_all(&store).await;
}

#[tokio::test]
async fn surreal_store_satisfies_contracts() {
    let store = surreal().await;
    run_all(&store).await;
}

#[tokio::test]
async fn surreal_store_round_trips_step_content() {
    let store = surreal().await;
    let header = TrajectoryHeader::new("a-1", Utc::now());
    store.create(&header).await.unwrap();

    let mut updated = header.next_revision();
    updated.step_count = 1;
    updated.status = TrajectoryStatus::Running;
    updated.started_at = Some(Utc::now());
    let mut s = step(1);
    s.stage = Stage::PreTool;
    s.role = Role::Model;
    s.content = Content::tool_request("Transfer", serde_json::json!({"amount": 12000}));
    s.snapshot = Some(serde_json::json!({"balance": 50}));
    store.append_step(&updated, &s).await.unwrap();

    let trajectory = store.get(&header.id).await.unwrap();
    assert_eq!(trajectory.steps, vec![s]);
    assert!(trajectory.header.started_at.is_some());
}

#[tokio::test]
async fn concurrent_appends_commit_each_seq_once() {
    let store = Arc::new(MemoryTrajectoryStore::new());
    let header = TrajectoryHeader::new("a-1", Utc::now());
    store.create(&header).await.unwrap();

    // Ten writers race for seq 1 from the same stale header.
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let store = store.clone();
            let header = header.clone();
            tokio::spawn(async move {
                let (updated, step) = next(&header);
                store.append_step(&updated, &step).await
            })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    let wins = results
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(()))))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(store.get(&header.id).await.unwrap().steps.len(), 1);
}

// ===========================================================================
// Ephemeral store
// ===========================================================================

#[tokio::test]
async fn ephemeral_store_tracks_lifecycle_without_history() {
    let store = EphemeralTrajectoryStore::new();
    let header = TrajectoryHeader::new("a-1", Utc::now());
    store.create(&header).await.unwrap();

    let (updated, step) = next(&header);
    store.append_step(&updated, &step).await.unwrap();
    assert_eq!(store.header(&header.id).await.unwrap().step_count, 1);

    // Sequencing still enforced.
    let err = store.append_step(&updated, &step).await.unwrap_err();
    assert!(matches!(err, StorageError::SequenceConflict { .. }));
}

#[tokio::test]
async fn ephemeral_store_reports_unknown_ids_as_missing() {
    let store = EphemeralTrajectoryStore::new();
    let unknown = TrajectoryHeader::new("a-1", Utc::now());
    assert!(matches!(
        store.get(&unknown.id).await.unwrap_err(),
        StorageError::TrajectoryNotFound { .. }
    ));
}

#[tokio::test]
async fn ephemeral_store_reports_history_unavailable() {
    let store = EphemeralTrajectoryStore::new();
    let header = TrajectoryHeader::new("a-1", Utc::now());
    store.create(&header).await.unwrap();

    let err = store.get(&header.id).await.unwrap_err();
    assert_eq!(
        err,
        StorageError::HistoryUnavailable {
            backend: "ephemeral".to_string()
        }
    );
    assert!(matches!(
        store.list(&TrajectoryFilter::default(), 10, None).await,
        Err(StorageError::HistoryUnavailable { .. })
    ));
    assert!(matches!(
        store.list_agents(None, 10, None).await,
        Err(StorageError::HistoryUnavailable { .. })
    ));
}
