//! Database row types for the SurrealDB backend.
//!
//! Rows carry the indexed columns plus a JSON `payload` holding the domain
//! value; conversion to `storage_traits` types happens at the store boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::{
    AnalysisRecord, RecordSlot, RepositoryState, RunRecord, RunStatus, StepResult, StorageResult,
};
use crate::StorageError;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Row in `analysis_records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecordRow {
    pub slot_id: String,
    pub repo_id: String,
    pub branch: String,
    pub commit_id: String,
    pub fingerprint: String,
    pub payload: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl AnalysisRecordRow {
    pub fn from_record(record: &AnalysisRecord) -> StorageResult<Self> {
        Ok(Self {
            slot_id: record.slot().storage_id(),
            repo_id: record.repo_id.clone(),
            branch: record.branch.clone(),
            commit_id: record.commit_id.clone(),
            fingerprint: record.fingerprint.to_string(),
            payload: serde_json::to_string(record)?,
            created_at: record.created_at,
        })
    }

    pub fn into_record(self) -> StorageResult<AnalysisRecord> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Row in `step_results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResultRow {
    pub step_key: String,
    pub slot_id: String,
    pub commit_id: String,
    pub step_id: String,
    pub payload: String,
}

impl StepResultRow {
    pub fn key(slot: &RecordSlot, commit_id: &str, step_id: &str) -> String {
        format!("{}:{}:{}", slot.storage_id(), commit_id, step_id)
    }

    pub fn from_step(slot: &RecordSlot, commit_id: &str, step: &StepResult) -> StorageResult<Self> {
        Ok(Self {
            step_key: Self::key(slot, commit_id, &step.step_id),
            slot_id: slot.storage_id(),
            commit_id: commit_id.to_string(),
            step_id: step.step_id.clone(),
            payload: serde_json::to_string(step)?,
        })
    }

    pub fn into_step(self) -> StorageResult<StepResult> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Row in `repo_states`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoStateRow {
    pub repo_id: String,
    pub branch: String,
    pub commit_id: String,
    #[serde(default, with = "surreal_datetime_opt")]
    pub last_analyzed_at: Option<DateTime<Utc>>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl From<&RepositoryState> for RepoStateRow {
    fn from(s: &RepositoryState) -> Self {
        Self {
            repo_id: s.repo_id.clone(),
            branch: s.branch.clone(),
            commit_id: s.commit_id.clone(),
            last_analyzed_at: s.last_analyzed_at,
            updated_at: s.updated_at,
        }
    }
}

impl From<RepoStateRow> for RepositoryState {
    fn from(r: RepoStateRow) -> Self {
        Self {
            repo_id: r.repo_id,
            branch: r.branch,
            commit_id: r.commit_id,
            last_analyzed_at: r.last_analyzed_at,
            updated_at: r.updated_at,
        }
    }
}

/// Row in `runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    pub run_id: String,
    pub repo_id: String,
    pub status: String,
    pub detail: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    pub fn running(run_id: String, repo_id: String) -> Self {
        Self {
            run_id,
            repo_id,
            status: RunStatus::Running.as_str().to_string(),
            detail: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn finish(mut self, status: RunStatus, detail: Option<String>) -> Self {
        self.status = status.as_str().to_string();
        self.detail = detail;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn into_record(self) -> StorageResult<RunRecord> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Backend(format!("unknown run status: {}", self.status)))?;
        Ok(RunRecord {
            run_id: crate::storage_traits::RunId(self.run_id),
            repo_id: self.repo_id,
            status,
            detail: self.detail,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

/// Row in `run_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventRow {
    pub run_id: String,
    pub seq: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}
