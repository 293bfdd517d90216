//! Trait contract tests for AnalysisStore and CheckpointLog.
//!
//! The same contract runs against the in-memory fakes, the file store and
//! the in-memory SurrealDB backend.

use chrono::{Duration, Utc};
use fleetscope_state::fakes::{FaultyStore, MemoryAnalysisStore, MemoryCheckpointLog};
use fleetscope_state::storage_traits::*;
use fleetscope_state::{
    FsAnalysisStore, FsCheckpointLog, StorageError, SurrealAnalysisStore, SurrealCheckpointLog,
};

fn step(id: &str, version: u32) -> StepResult {
    StepResult {
        step_id: id.to_string(),
        content: format!("{id} content v{version}"),
        generated_at: Utc::now(),
        template_version: version,
        applicable: true,
        usage: TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

fn record(repo: &str, branch: &str, commit: &str) -> AnalysisRecord {
    let now = Utc::now();
    AnalysisRecord {
        repo_id: repo.to_string(),
        branch: branch.to_string(),
        commit_id: commit.to_string(),
        fingerprint: Fingerprint::from_bytes(commit.as_bytes()),
        category: "backend".to_string(),
        steps: vec![step("overview", 1), step("dependencies", 1)],
        run_id: RunId::new(),
        created_at: now,
        expires_at: now + Duration::days(30),
    }
}

async fn analysis_store_contract(store: &dyn AnalysisStore) {
    let slot = RecordSlot::new("svc", "main");

    // absent
    assert!(store.get_record(&slot).await.unwrap().is_none());
    assert!(store.latest_record("svc").await.unwrap().is_none());

    // upsert, latest wins
    let first = record("svc", "main", "abc123");
    store.put_record(&first).await.unwrap();
    let second = record("svc", "main", "def456");
    store.put_record(&second).await.unwrap();
    let got = store.get_record(&slot).await.unwrap().unwrap();
    assert_eq!(got.commit_id, "def456");
    assert_eq!(got.steps.len(), 2);
    assert_eq!(got.steps[0].step_id, "overview");
    assert_eq!(store.list_records().await.unwrap().len(), 1);

    // another branch is a separate slot; latest_record spans branches
    let mut dev = record("svc", "dev", "fff000");
    dev.created_at = second.created_at + Duration::seconds(5);
    store.put_record(&dev).await.unwrap();
    assert_eq!(store.list_records().await.unwrap().len(), 2);
    let latest = store.latest_record("svc").await.unwrap().unwrap();
    assert_eq!(latest.branch, "dev");

    store.delete_record(&RecordSlot::new("svc", "dev")).await.unwrap();
    assert_eq!(store.list_records().await.unwrap().len(), 1);

    // steps are keyed by commit
    store.put_step(&slot, "abc123", &step("overview", 1)).await.unwrap();
    store.put_step(&slot, "abc123", &step("overview", 2)).await.unwrap();
    store.put_step(&slot, "abc123", &step("api_surface", 1)).await.unwrap();
    store.put_step(&slot, "def456", &step("overview", 3)).await.unwrap();

    let s = store.get_step(&slot, "abc123", "overview").await.unwrap().unwrap();
    assert_eq!(s.template_version, 2);
    assert!(store.get_step(&slot, "abc123", "security").await.unwrap().is_none());

    let ids: Vec<String> = store
        .list_steps(&slot, "abc123")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.step_id)
        .collect();
    assert_eq!(ids, vec!["api_surface".to_string(), "overview".to_string()]);

    store.prune_steps(&slot, "def456").await.unwrap();
    assert!(store.list_steps(&slot, "abc123").await.unwrap().is_empty());
    assert_eq!(store.list_steps(&slot, "def456").await.unwrap().len(), 1);

    // repository state
    assert!(store.get_repo_state("svc").await.unwrap().is_none());
    let state = RepositoryState {
        repo_id: "svc".into(),
        branch: "main".into(),
        commit_id: "def456".into(),
        last_analyzed_at: Some(Utc::now()),
        updated_at: Utc::now(),
    };
    store.put_repo_state(&state).await.unwrap();
    let got = store.get_repo_state("svc").await.unwrap().unwrap();
    assert_eq!(got.commit_id, "def456");

    store.ping().await.unwrap();
}

async fn checkpoint_log_contract(log: &dyn CheckpointLog) {
    let run = log.begin_run("svc").await.unwrap();
    let header = log.get_run(&run).await.unwrap();
    assert_eq!(header.status, RunStatus::Running);
    assert!(header.completed_at.is_none());

    log.append(&run, CheckpointEvent::new(1, "phase", serde_json::json!({"phase": "cache_check"})))
        .await
        .unwrap();
    log.append(&run, CheckpointEvent::new(2, "step_completed", serde_json::json!({"step": "overview"})))
        .await
        .unwrap();

    let events = log.events(&run).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].seq, 1);
    assert_eq!(events[1].kind, "step_completed");

    log.finish_run(&run, RunStatus::Succeeded, None).await.unwrap();
    let header = log.get_run(&run).await.unwrap();
    assert_eq!(header.status, RunStatus::Succeeded);
    assert!(header.completed_at.is_some());

    // terminal runs are closed
    let err = log
        .append(&run, CheckpointEvent::new(3, "late", serde_json::json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
    let err = log
        .finish_run(&run, RunStatus::Failed, Some("again".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));

    let other = log.begin_run("lib").await.unwrap();
    log.finish_run(&other, RunStatus::Failed, Some("clone failed".into()))
        .await
        .unwrap();

    assert_eq!(log.list_runs(None).await.unwrap().len(), 2);
    let svc_runs = log.list_runs(Some("svc")).await.unwrap();
    assert_eq!(svc_runs.len(), 1);
    assert_eq!(svc_runs[0].run_id, run);

    let missing = RunId::new();
    assert!(matches!(
        log.get_run(&missing).await.unwrap_err(),
        StorageError::RunNotFound { .. }
    ));
}

#[tokio::test]
async fn memory_store_satisfies_contract() {
    analysis_store_contract(&MemoryAnalysisStore::new()).await;
}

#[tokio::test]
async fn fs_store_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsAnalysisStore::open(dir.path()).unwrap();
    analysis_store_contract(&store).await;
}

#[tokio::test]
async fn surreal_store_satisfies_contract() {
    let store = SurrealAnalysisStore::in_memory().await.unwrap();
    analysis_store_contract(&store).await;
}

#[tokio::test]
async fn memory_log_satisfies_contract() {
    checkpoint_log_contract(&MemoryCheckpointLog::new()).await;
}

#[tokio::test]
async fn fs_log_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    let log = FsCheckpointLog::open(dir.path()).unwrap();
    checkpoint_log_contract(&log).await;
}

#[tokio::test]
async fn surreal_log_satisfies_contract() {
    let log = SurrealCheckpointLog::in_memory().await.unwrap();
    checkpoint_log_contract(&log).await;
}

#[tokio::test]
async fn faulty_store_surfaces_backend_errors() {
    let store = FaultyStore::new();
    let slot = RecordSlot::new("svc", "main");
    store.put_record(&record("svc", "main", "abc")).await.unwrap();

    store.set_fail_reads(true);
    assert!(matches!(
        store.get_record(&slot).await.unwrap_err(),
        StorageError::Backend(_)
    ));
    assert!(store.ping().await.is_err());

    store.set_fail_reads(false);
    store.set_fail_writes(true);
    assert!(store.put_record(&record("svc", "main", "def")).await.is_err());
    // the failed write left the previous record intact
    let got = store.get_record(&slot).await.unwrap().unwrap();
    assert_eq!(got.commit_id, "abc");
}

#[tokio::test]
async fn memory_store_counts_writes() {
    let store = MemoryAnalysisStore::new();
    let slot = RecordSlot::new("svc", "main");
    store.get_record(&slot).await.unwrap();
    assert_eq!(store.write_count(), 0);
    store.put_record(&record("svc", "main", "abc")).await.unwrap();
    assert_eq!(store.write_count(), 1);
}
