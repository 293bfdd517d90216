//! SurrealDB-backed `AnalysisStore` and `CheckpointLog` implementations
//!
//! Uses the row types in `schema`, converting to/from `storage_traits` types
//! at the boundary. Record and step writes are single `UPSERT` statements on
//! deterministic record ids, so each write is atomic.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle;
use crate::schema::{AnalysisRecordRow, RepoStateRow, RunEventRow, RunRow, StepResultRow};
use crate::storage_traits::*;

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed implementation of [`AnalysisStore`].
#[derive(Clone)]
pub struct SurrealAnalysisStore {
    db: Surreal<Any>,
}

impl SurrealAnalysisStore {
    /// Wrap an already-initialised connection.
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(handle::connect_memory().await?))
    }

    /// Create from environment variables; see [`handle::connect_from_env`].
    pub async fn from_env() -> crate::Result<Self> {
        let db = handle::connect_from_env().await?;
        info!("SurrealAnalysisStore ready");
        Ok(Self::new(db))
    }

    /// Share the underlying connection.
    pub fn connection(&self) -> Surreal<Any> {
        self.db.clone()
    }

    async fn select_records(
        &self,
        sql: &'static str,
        bind: Option<(&'static str, String)>,
    ) -> StorageResult<Vec<AnalysisRecord>> {
        let mut query = self.db.query(sql);
        if let Some(b) = bind {
            query = query.bind(b);
        }
        let mut res = query.await.map_err(backend)?;
        let rows: Vec<AnalysisRecordRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(AnalysisRecordRow::into_record).collect()
    }
}

#[async_trait]
impl AnalysisStore for SurrealAnalysisStore {
    async fn get_record(&self, slot: &RecordSlot) -> StorageResult<Option<AnalysisRecord>> {
        let records = self
            .select_records(
                "SELECT * FROM analysis_records WHERE slot_id = $sid",
                Some(("sid", slot.storage_id())),
            )
            .await?;
        Ok(records.into_iter().next())
    }

    async fn latest_record(&self, repo_id: &str) -> StorageResult<Option<AnalysisRecord>> {
        let records = self
            .select_records(
                "SELECT * FROM analysis_records WHERE repo_id = $rid ORDER BY created_at DESC LIMIT 1",
                Some(("rid", repo_id.to_string())),
            )
            .await?;
        Ok(records.into_iter().next())
    }

    async fn put_record(&self, record: &AnalysisRecord) -> StorageResult<()> {
        let row = AnalysisRecordRow::from_record(record)?;
        let sid = row.slot_id.clone();
        debug!(slot = %record.slot(), commit = %record.commit_id, "upserting analysis record");

        self.db
            .query("UPSERT type::thing('analysis_records', $sid) CONTENT $row")
            .bind(("sid", sid))
            .bind(("row", row))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn delete_record(&self, slot: &RecordSlot) -> StorageResult<()> {
        self.db
            .query("DELETE analysis_records WHERE slot_id = $sid")
            .bind(("sid", slot.storage_id()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn list_records(&self) -> StorageResult<Vec<AnalysisRecord>> {
        let mut records = self
            .select_records("SELECT * FROM analysis_records", None)
            .await?;
        records.sort_by(|a, b| a.slot().cmp(&b.slot()));
        Ok(records)
    }

    async fn get_step(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
        step_id: &str,
    ) -> StorageResult<Option<StepResult>> {
        let mut res = self
            .db
            .query("SELECT * FROM step_results WHERE step_key = $key")
            .bind(("key", StepResultRow::key(slot, commit_id, step_id)))
            .await
            .map_err(backend)?;
        let rows: Vec<StepResultRow> = res.take(0).map_err(backend)?;
        rows.into_iter().next().map(StepResultRow::into_step).transpose()
    }

    async fn put_step(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
        result: &StepResult,
    ) -> StorageResult<()> {
        let row = StepResultRow::from_step(slot, commit_id, result)?;
        let key = row.step_key.clone();

        self.db
            .query("UPSERT type::thing('step_results', $key) CONTENT $row")
            .bind(("key", key))
            .bind(("row", row))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn list_steps(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
    ) -> StorageResult<Vec<StepResult>> {
        let mut res = self
            .db
            .query("SELECT * FROM step_results WHERE slot_id = $sid AND commit_id = $cid ORDER BY step_id ASC")
            .bind(("sid", slot.storage_id()))
            .bind(("cid", commit_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<StepResultRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(StepResultRow::into_step).collect()
    }

    async fn prune_steps(&self, slot: &RecordSlot, keep_commit: &str) -> StorageResult<()> {
        self.db
            .query("DELETE step_results WHERE slot_id = $sid AND commit_id != $cid")
            .bind(("sid", slot.storage_id()))
            .bind(("cid", keep_commit.to_string()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn get_repo_state(&self, repo_id: &str) -> StorageResult<Option<RepositoryState>> {
        let mut res = self
            .db
            .query("SELECT * FROM repo_states WHERE repo_id = $rid")
            .bind(("rid", repo_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<RepoStateRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next().map(RepositoryState::from))
    }

    async fn put_repo_state(&self, state: &RepositoryState) -> StorageResult<()> {
        let row = RepoStateRow::from(state);
        self.db
            .query("UPSERT type::thing('repo_states', $rid) CONTENT $row")
            .bind(("rid", state.repo_id.clone()))
            .bind(("row", row))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn ping(&self) -> StorageResult<()> {
        self.db
            .query("RETURN true")
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }
}

/// SurrealDB-backed implementation of [`CheckpointLog`].
#[derive(Clone)]
pub struct SurrealCheckpointLog {
    db: Surreal<Any>,
}

impl SurrealCheckpointLog {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(handle::connect_memory().await?))
    }

    async fn fetch_run(&self, rid: &str) -> StorageResult<RunRow> {
        let mut res = self
            .db
            .query("SELECT * FROM runs WHERE run_id = $rid")
            .bind(("rid", rid.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<RunRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: rid.to_string(),
            })
    }

    async fn fetch_running(&self, rid: &str) -> StorageResult<RunRow> {
        let row = self.fetch_run(rid).await?;
        if row.status != RunStatus::Running.as_str() {
            return Err(StorageError::InvalidRunState {
                run_id: rid.to_string(),
                status: row.status,
                expected: RunStatus::Running.to_string(),
            });
        }
        Ok(row)
    }
}

#[async_trait]
impl CheckpointLog for SurrealCheckpointLog {
    async fn begin_run(&self, repo_id: &str) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let row = RunRow::running(run_id.0.clone(), repo_id.to_string());
        debug!(run_id = %run_id, repo = repo_id, "creating checkpoint run");

        let _created: Option<RunRow> = self
            .db
            .create("runs")
            .content(row)
            .await
            .map_err(backend)?;
        Ok(run_id)
    }

    async fn append(&self, run_id: &RunId, event: CheckpointEvent) -> StorageResult<()> {
        self.fetch_running(&run_id.0).await?;
        let row = RunEventRow {
            run_id: run_id.0.clone(),
            seq: event.seq,
            kind: event.kind,
            payload: event.payload,
            timestamp: event.timestamp,
        };
        let _created: Option<RunEventRow> = self
            .db
            .create("run_events")
            .content(row)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        detail: Option<String>,
    ) -> StorageResult<()> {
        let row = self.fetch_running(&run_id.0).await?.finish(status, detail);
        self.db
            .query("UPDATE runs MERGE $row WHERE run_id = $rid")
            .bind(("row", row))
            .bind(("rid", run_id.0.clone()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.fetch_run(&run_id.0).await?.into_record()
    }

    async fn events(&self, run_id: &RunId) -> StorageResult<Vec<CheckpointEvent>> {
        self.fetch_run(&run_id.0).await?;
        let mut res = self
            .db
            .query("SELECT * FROM run_events WHERE run_id = $rid ORDER BY seq ASC")
            .bind(("rid", run_id.0.clone()))
            .await
            .map_err(backend)?;
        let rows: Vec<RunEventRow> = res.take(0).map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|r| CheckpointEvent {
                seq: r.seq,
                kind: r.kind,
                payload: r.payload,
                timestamp: r.timestamp,
            })
            .collect())
    }

    async fn list_runs(&self, repo_id: Option<&str>) -> StorageResult<Vec<RunRecord>> {
        let mut res = match repo_id {
            Some(repo) => self
                .db
                .query("SELECT * FROM runs WHERE repo_id = $repo ORDER BY created_at DESC")
                .bind(("repo", repo.to_string()))
                .await
                .map_err(backend)?,
            None => self
                .db
                .query("SELECT * FROM runs ORDER BY created_at DESC")
                .await
                .map_err(backend)?,
        };
        let rows: Vec<RunRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(RunRow::into_record).collect()
    }
}
