//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryAnalysisStore` and `MemoryCheckpointLog` that satisfy the
//! trait contracts without any external dependencies, plus `FaultyStore` for
//! exercising backend outages.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryAnalysisStore
// ---------------------------------------------------------------------------

type StepMap = BTreeMap<(RecordSlot, String), BTreeMap<String, StepResult>>;

/// In-memory analysis store backed by maps behind a `Mutex`.
#[derive(Debug, Default)]
pub struct MemoryAnalysisStore {
    records: Mutex<BTreeMap<RecordSlot, AnalysisRecord>>,
    steps: Mutex<StepMap>,
    repo_states: Mutex<HashMap<String, RepositoryState>>,
    writes: AtomicU64,
}

impl MemoryAnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful mutating calls since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl AnalysisStore for MemoryAnalysisStore {
    async fn get_record(&self, slot: &RecordSlot) -> StorageResult<Option<AnalysisRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records.get(slot).cloned())
    }

    async fn latest_record(&self, repo_id: &str) -> StorageResult<Option<AnalysisRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|r| r.repo_id == repo_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn put_record(&self, record: &AnalysisRecord) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap();
        records.insert(record.slot(), record.clone());
        self.bump();
        Ok(())
    }

    async fn delete_record(&self, slot: &RecordSlot) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap();
        records.remove(slot);
        self.bump();
        Ok(())
    }

    async fn list_records(&self) -> StorageResult<Vec<AnalysisRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records.values().cloned().collect())
    }

    async fn get_step(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
        step_id: &str,
    ) -> StorageResult<Option<StepResult>> {
        let steps = self.steps.lock().unwrap();
        Ok(steps
            .get(&(slot.clone(), commit_id.to_string()))
            .and_then(|m| m.get(step_id))
            .cloned())
    }

    async fn put_step(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
        result: &StepResult,
    ) -> StorageResult<()> {
        let mut steps = self.steps.lock().unwrap();
        steps
            .entry((slot.clone(), commit_id.to_string()))
            .or_default()
            .insert(result.step_id.clone(), result.clone());
        self.bump();
        Ok(())
    }

    async fn list_steps(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
    ) -> StorageResult<Vec<StepResult>> {
        let steps = self.steps.lock().unwrap();
        Ok(steps
            .get(&(slot.clone(), commit_id.to_string()))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn prune_steps(&self, slot: &RecordSlot, keep_commit: &str) -> StorageResult<()> {
        let mut steps = self.steps.lock().unwrap();
        steps.retain(|(s, commit), _| s != slot || commit == keep_commit);
        self.bump();
        Ok(())
    }

    async fn get_repo_state(&self, repo_id: &str) -> StorageResult<Option<RepositoryState>> {
        let states = self.repo_states.lock().unwrap();
        Ok(states.get(repo_id).cloned())
    }

    async fn put_repo_state(&self, state: &RepositoryState) -> StorageResult<()> {
        let mut states = self.repo_states.lock().unwrap();
        states.insert(state.repo_id.clone(), state.clone());
        self.bump();
        Ok(())
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FaultyStore
// ---------------------------------------------------------------------------

/// Wraps a `MemoryAnalysisStore` and fails reads and/or writes on demand.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryAnalysisStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails.
    pub fn unavailable() -> Self {
        let store = Self::default();
        store.set_fail_reads(true);
        store.set_fail_writes(true);
        store
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryAnalysisStore {
        &self.inner
    }

    fn check_read(&self) -> StorageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("store unavailable (read)".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("store unavailable (write)".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AnalysisStore for FaultyStore {
    async fn get_record(&self, slot: &RecordSlot) -> StorageResult<Option<AnalysisRecord>> {
        self.check_read()?;
        self.inner.get_record(slot).await
    }

    async fn latest_record(&self, repo_id: &str) -> StorageResult<Option<AnalysisRecord>> {
        self.check_read()?;
        self.inner.latest_record(repo_id).await
    }

    async fn put_record(&self, record: &AnalysisRecord) -> StorageResult<()> {
        self.check_write()?;
        self.inner.put_record(record).await
    }

    async fn delete_record(&self, slot: &RecordSlot) -> StorageResult<()> {
        self.check_write()?;
        self.inner.delete_record(slot).await
    }

    async fn list_records(&self) -> StorageResult<Vec<AnalysisRecord>> {
        self.check_read()?;
        self.inner.list_records().await
    }

    async fn get_step(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
        step_id: &str,
    ) -> StorageResult<Option<StepResult>> {
        self.check_read()?;
        self.inner.get_step(slot, commit_id, step_id).await
    }

    async fn put_step(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
        result: &StepResult,
    ) -> StorageResult<()> {
        self.check_write()?;
        self.inner.put_step(slot, commit_id, result).await
    }

    async fn list_steps(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
    ) -> StorageResult<Vec<StepResult>> {
        self.check_read()?;
        self.inner.list_steps(slot, commit_id).await
    }

    async fn prune_steps(&self, slot: &RecordSlot, keep_commit: &str) -> StorageResult<()> {
        self.check_write()?;
        self.inner.prune_steps(slot, keep_commit).await
    }

    async fn get_repo_state(&self, repo_id: &str) -> StorageResult<Option<RepositoryState>> {
        self.check_read()?;
        self.inner.get_repo_state(repo_id).await
    }

    async fn put_repo_state(&self, state: &RepositoryState) -> StorageResult<()> {
        self.check_write()?;
        self.inner.put_repo_state(state).await
    }

    async fn ping(&self) -> StorageResult<()> {
        self.check_read()
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointLog
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<CheckpointEvent>,
}

/// In-memory checkpoint log backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryCheckpointLog {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryCheckpointLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointLog for MemoryCheckpointLog {
    async fn begin_run(&self, repo_id: &str) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            repo_id: repo_id.to_string(),
            status: RunStatus::Running,
            detail: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            run_id.0.clone(),
            RunState {
                record,
                events: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn append(&self, run_id: &RunId, event: CheckpointEvent) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: state.record.status.to_string(),
                expected: RunStatus::Running.to_string(),
            });
        }
        state.events.push(event);
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        detail: Option<String>,
    ) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: state.record.status.to_string(),
                expected: RunStatus::Running.to_string(),
            });
        }
        state.record.status = status;
        state.record.detail = detail;
        state.record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn events(&self, run_id: &RunId) -> StorageResult<Vec<CheckpointEvent>> {
        let runs = self.runs.lock().unwrap();
        let state = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        let mut events = state.events.clone();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(&self, repo_id: Option<&str>) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut records: Vec<RunRecord> = runs
            .values()
            .filter(|s| repo_id.map_or(true, |r| s.record.repo_id == r))
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
