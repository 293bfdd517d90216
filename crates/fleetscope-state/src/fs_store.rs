//! Local file-backed stores.
//!
//! Layout under `root`:
//! ```text
//! records/<slot id>.json
//! steps/<slot id>/<commit>/<step id>.json
//! repos/<repo digest>.json
//! runs/<run id>.json
//! runs/<run id>.events.jsonl
//! ```
//!
//! Every JSON document is written to a temp file in its target directory and
//! renamed into place, so a reader sees either the old or the new document.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{StateError, StorageError};
use crate::storage_traits::*;

fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::Backend(format!("no parent dir for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StorageError::from(e.error))?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn json_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Map an identifier onto a file-name-safe component.
fn file_component(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() || safe.starts_with('.') {
        format!("_{safe}")
    } else {
        safe
    }
}

// ---------------------------------------------------------------------------
// FsAnalysisStore
// ---------------------------------------------------------------------------

/// Filesystem-backed [`AnalysisStore`].
pub struct FsAnalysisStore {
    root: PathBuf,
}

impl FsAnalysisStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> crate::Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in ["records", "steps", "repos"] {
            fs::create_dir_all(root.join(sub)).map_err(StateError::Io)?;
        }
        debug!(root = %root.display(), "opened file analysis store");
        Ok(Self { root })
    }

    fn record_path(&self, slot: &RecordSlot) -> PathBuf {
        self.root
            .join("records")
            .join(format!("{}.json", slot.storage_id()))
    }

    fn commit_dir(&self, slot: &RecordSlot, commit_id: &str) -> PathBuf {
        self.root
            .join("steps")
            .join(slot.storage_id())
            .join(file_component(commit_id))
    }

    fn repo_path(&self, repo_id: &str) -> PathBuf {
        let digest = sha256_hex(repo_id.as_bytes());
        self.root.join("repos").join(format!("{}.json", &digest[..32]))
    }
}

#[async_trait]
impl AnalysisStore for FsAnalysisStore {
    async fn get_record(&self, slot: &RecordSlot) -> StorageResult<Option<AnalysisRecord>> {
        read_json(&self.record_path(slot))
    }

    async fn latest_record(&self, repo_id: &str) -> StorageResult<Option<AnalysisRecord>> {
        let records = self.list_records().await?;
        Ok(records
            .into_iter()
            .filter(|r| r.repo_id == repo_id)
            .max_by_key(|r| r.created_at))
    }

    async fn put_record(&self, record: &AnalysisRecord) -> StorageResult<()> {
        write_json(&self.record_path(&record.slot()), record)
    }

    async fn delete_record(&self, slot: &RecordSlot) -> StorageResult<()> {
        match fs::remove_file(self.record_path(slot)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_records(&self) -> StorageResult<Vec<AnalysisRecord>> {
        let mut records = Vec::new();
        for path in json_files(&self.root.join("records"))? {
            if let Some(record) = read_json::<AnalysisRecord>(&path)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.slot().cmp(&b.slot()));
        Ok(records)
    }

    async fn get_step(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
        step_id: &str,
    ) -> StorageResult<Option<StepResult>> {
        let path = self
            .commit_dir(slot, commit_id)
            .join(format!("{}.json", file_component(step_id)));
        read_json(&path)
    }

    async fn put_step(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
        result: &StepResult,
    ) -> StorageResult<()> {
        let path = self
            .commit_dir(slot, commit_id)
            .join(format!("{}.json", file_component(&result.step_id)));
        write_json(&path, result)
    }

    async fn list_steps(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
    ) -> StorageResult<Vec<StepResult>> {
        let mut steps = Vec::new();
        for path in json_files(&self.commit_dir(slot, commit_id))? {
            if let Some(step) = read_json::<StepResult>(&path)? {
                steps.push(step);
            }
        }
        steps.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(steps)
    }

    async fn prune_steps(&self, slot: &RecordSlot, keep_commit: &str) -> StorageResult<()> {
        let slot_dir = self.root.join("steps").join(slot.storage_id());
        let entries = match fs::read_dir(&slot_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let keep = file_component(keep_commit);
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy() != keep.as_str() {
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "failed to prune step dir");
                }
            }
        }
        Ok(())
    }

    async fn get_repo_state(&self, repo_id: &str) -> StorageResult<Option<RepositoryState>> {
        read_json(&self.repo_path(repo_id))
    }

    async fn put_repo_state(&self, state: &RepositoryState) -> StorageResult<()> {
        write_json(&self.repo_path(&state.repo_id), state)
    }

    async fn ping(&self) -> StorageResult<()> {
        let meta = fs::metadata(&self.root)?;
        if !meta.is_dir() {
            return Err(StorageError::Backend(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FsCheckpointLog
// ---------------------------------------------------------------------------

/// Filesystem-backed [`CheckpointLog`]: one JSON header and one JSONL event
/// file per run.
pub struct FsCheckpointLog {
    runs_dir: PathBuf,
}

impl FsCheckpointLog {
    pub fn open(root: impl AsRef<Path>) -> crate::Result<Self> {
        let runs_dir = root.as_ref().join("runs");
        fs::create_dir_all(&runs_dir).map_err(StateError::Io)?;
        Ok(Self { runs_dir })
    }

    fn header_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir
            .join(format!("{}.json", file_component(&run_id.0)))
    }

    fn events_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir
            .join(format!("{}.events.jsonl", file_component(&run_id.0)))
    }

    fn running(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let record = self.header(run_id)?;
        if record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: record.status.to_string(),
                expected: RunStatus::Running.to_string(),
            });
        }
        Ok(record)
    }

    fn header(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        read_json(&self.header_path(run_id))?.ok_or_else(|| StorageError::RunNotFound {
            run_id: run_id.0.clone(),
        })
    }
}

#[async_trait]
impl CheckpointLog for FsCheckpointLog {
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
        write_json(&self.header_path(&run_id), &record)?;
        Ok(run_id)
    }

    async fn append(&self, run_id: &RunId, event: CheckpointEvent) -> StorageResult<()> {
        self.running(run_id)?;
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(run_id))?;
        file.write_all(&line)?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        detail: Option<String>,
    ) -> StorageResult<()> {
        let mut record = self.running(run_id)?;
        record.status = status;
        record.detail = detail;
        record.completed_at = Some(Utc::now());
        write_json(&self.header_path(run_id), &record)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.header(run_id)
    }

    async fn events(&self, run_id: &RunId) -> StorageResult<Vec<CheckpointEvent>> {
        self.header(run_id)?;
        let file = match fs::File::open(self.events_path(run_id)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str::<CheckpointEvent>(&line)?);
        }
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(&self, repo_id: Option<&str>) -> StorageResult<Vec<RunRecord>> {
        let mut runs = Vec::new();
        for path in json_files(&self.runs_dir)? {
            if let Some(record) = read_json::<RunRecord>(&path)? {
                if repo_id.map_or(true, |r| record.repo_id == r) {
                    runs.push(record);
                }
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsAnalysisStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAnalysisStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn step(id: &str, version: u32) -> StepResult {
        StepResult {
            step_id: id.to_string(),
            content: format!("{id} findings"),
            generated_at: Utc::now(),
            template_version: version,
            applicable: true,
            usage: TokenUsage::default(),
        }
    }

    #[test]
    fn file_component_replaces_separators() {
        assert_eq!(file_component("feature/x"), "feature_x");
        assert_eq!(file_component(".."), "_..");
        assert_eq!(file_component("overview"), "overview");
    }

    #[tokio::test]
    async fn step_roundtrip_and_prune() {
        let (_dir, store) = make_store();
        let slot = RecordSlot::new("svc", "main");
        store.put_step(&slot, "abc", &step("overview", 1)).await.unwrap();
        store.put_step(&slot, "def", &step("overview", 2)).await.unwrap();

        let got = store.get_step(&slot, "abc", "overview").await.unwrap();
        assert_eq!(got.unwrap().template_version, 1);

        store.prune_steps(&slot, "def").await.unwrap();
        assert!(store.list_steps(&slot, "abc").await.unwrap().is_empty());
        assert_eq!(store.list_steps(&slot, "def").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let (dir, store) = make_store();
        let slot = RecordSlot::new("svc", "main");
        store.put_step(&slot, "abc", &step("overview", 1)).await.unwrap();
        store.put_step(&slot, "abc", &step("overview", 2)).await.unwrap();

        let commit_dir = dir
            .path()
            .join("steps")
            .join(slot.storage_id())
            .join("abc");
        let names: Vec<_> = fs::read_dir(commit_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["overview.json".to_string()]);
    }

    #[tokio::test]
    async fn checkpoint_events_are_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let log = FsCheckpointLog::open(dir.path()).unwrap();
        let run = log.begin_run("svc").await.unwrap();
        log.append(&run, CheckpointEvent::new(2, "b", serde_json::json!({})))
            .await
            .unwrap();
        log.append(&run, CheckpointEvent::new(1, "a", serde_json::json!({})))
            .await
            .unwrap();
        let kinds: Vec<_> = log
            .events(&run)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec!["a", "b"]);
    }
}
