//! Storage trait definitions for fleetscope
//!
//! These traits define the persistence abstractions the engine depends on:
//! - `AnalysisStore`: analysis records, step results and repository state
//! - `CheckpointLog`: per-run event log keyed by repo id + run id
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Template-version fingerprint (SHA-256 hex string).
///
/// The inner field is private so the value is always 64 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the SHA-256 fingerprint of the given canonical bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Fingerprint(sha256_hex(data))
    }

    /// Fingerprint over ordered canonical lines, joined with `\n`.
    pub fn compute<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = lines
            .into_iter()
            .map(|l| l.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        Self::from_bytes(joined.as_bytes())
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidFingerprint { value: s });
        }
        Ok(Fingerprint(s.to_ascii_lowercase()))
    }
}

impl From<Fingerprint> for String {
    fn from(f: Fingerprint) -> Self {
        f.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unit of write exclusivity: one live record per (repo id, branch).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordSlot {
    pub repo_id: String,
    pub branch: String,
}

impl RecordSlot {
    pub fn new(repo_id: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            branch: branch.into(),
        }
    }

    /// Stable backend key for this slot, safe for file names and record ids.
    pub fn storage_id(&self) -> String {
        let joined = format!("{}\u{0}{}", self.repo_id, self.branch);
        sha256_hex(joined.as_bytes())[..32].to_string()
    }
}

impl std::fmt::Display for RecordSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repo_id, self.branch)
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// AnalysisStore: records, steps, repository state
// ---------------------------------------------------------------------------

/// Token accounting reported by the analysis provider for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Output of one pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub content: String,
    pub generated_at: DateTime<Utc>,
    pub template_version: u32,
    /// `false` when the content is a "not applicable" marker.
    #[serde(default = "default_true")]
    pub applicable: bool,
    #[serde(default)]
    pub usage: TokenUsage,
}

fn default_true() -> bool {
    true
}

/// Merged, cache-persisted result of one complete pipeline run at one commit.
///
/// Records are superseded by a newer record for the same slot, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub repo_id: String,
    pub branch: String,
    pub commit_id: String,
    pub fingerprint: Fingerprint,
    pub category: String,
    /// Step results in pipeline order.
    pub steps: Vec<StepResult>,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AnalysisRecord {
    pub fn slot(&self) -> RecordSlot {
        RecordSlot::new(self.repo_id.clone(), self.branch.clone())
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Last observed state of a repository, refreshed on every investigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryState {
    pub repo_id: String,
    pub branch: String,
    pub commit_id: String,
    pub last_analyzed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Backend for analysis records, step results and repository state.
///
/// Guarantees:
/// - `put_record` is an atomic upsert keyed by `RecordSlot`; latest wins and a
///   reader never observes a partially written record.
/// - `put_step` is atomic per (slot, commit, step).
/// - `get_*` return `Ok(None)` for absent keys; `Err` means the backend failed.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Fetch the live record for a slot.
    async fn get_record(&self, slot: &RecordSlot) -> StorageResult<Option<AnalysisRecord>>;

    /// Newest record for a repository across all branches.
    async fn latest_record(&self, repo_id: &str) -> StorageResult<Option<AnalysisRecord>>;

    /// Upsert the record for its slot.
    async fn put_record(&self, record: &AnalysisRecord) -> StorageResult<()>;

    /// Remove the record for a slot. No-op if absent.
    async fn delete_record(&self, slot: &RecordSlot) -> StorageResult<()>;

    /// All live records, ordered by slot.
    async fn list_records(&self) -> StorageResult<Vec<AnalysisRecord>>;

    /// Fetch one step result stored for a commit.
    async fn get_step(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
        step_id: &str,
    ) -> StorageResult<Option<StepResult>>;

    /// Upsert one step result for a commit.
    async fn put_step(
        &self,
        slot: &RecordSlot,
        commit_id: &str,
        result: &StepResult,
    ) -> StorageResult<()>;

    /// All step results stored for a commit, ordered by step id.
    async fn list_steps(&self, slot: &RecordSlot, commit_id: &str)
        -> StorageResult<Vec<StepResult>>;

    /// Drop step results of every commit other than `keep_commit`.
    async fn prune_steps(&self, slot: &RecordSlot, keep_commit: &str) -> StorageResult<()>;

    async fn get_repo_state(&self, repo_id: &str) -> StorageResult<Option<RepositoryState>>;

    async fn put_repo_state(&self, state: &RepositoryState) -> StorageResult<()>;

    /// Cheap liveness check.
    async fn ping(&self) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// CheckpointLog: per-run event log
// ---------------------------------------------------------------------------

/// Unique identifier for one investigation run of one repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal or in-progress status of a checkpoint run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    CacheHit,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::CacheHit => "cache_hit",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "cache_hit" => Some(RunStatus::CacheHit),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event appended to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    /// Monotonic sequence number within the run, starting at 1
    pub seq: u64,
    /// Event kind, e.g. "phase", "step_completed", "step_reused"
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl CheckpointEvent {
    pub fn new(seq: u64, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            seq,
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Stored header of a checkpoint run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub repo_id: String,
    pub status: RunStatus,
    /// Failure or cancellation detail for terminal runs.
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only event log of investigation runs.
///
/// Guarantees:
/// - Events can only be appended to a run in `Running` status.
/// - `finish_run` moves a run out of `Running` exactly once.
/// - `events` returns events ordered by `seq`.
#[async_trait]
pub trait CheckpointLog: Send + Sync {
    /// Open a new run for a repository.
    async fn begin_run(&self, repo_id: &str) -> StorageResult<RunId>;

    /// Append an event to a running run.
    async fn append(&self, run_id: &RunId, event: CheckpointEvent) -> StorageResult<()>;

    /// Close a run with a terminal status.
    async fn finish_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        detail: Option<String>,
    ) -> StorageResult<()>;

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    async fn events(&self, run_id: &RunId) -> StorageResult<Vec<CheckpointEvent>>;

    /// Runs, newest first, optionally filtered by repository.
    async fn list_runs(&self, repo_id: Option<&str>) -> StorageResult<Vec<RunRecord>>;
}
