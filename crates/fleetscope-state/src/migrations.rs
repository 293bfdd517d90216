//! SurrealDB schema migrations and initialization
//!
//! Defines every table with its unique keys and lookup indexes. Safe to run on
//! every connection (all statements are idempotent).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StateError;
use crate::Result;

/// Initialize all fleetscope tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing fleetscope SurrealDB schema");

    init_analysis_records_table(db).await?;
    init_step_results_table(db).await?;
    init_repo_states_table(db).await?;
    init_runs_table(db).await?;
    init_run_events_table(db).await?;

    info!("fleetscope schema initialization complete");
    Ok(())
}

async fn apply(db: &Surreal<Any>, table: &str, sql: &str) -> Result<()> {
    debug!(table, "initializing table");
    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?
        .check()
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?;
    Ok(())
}

/// `analysis_records`: one live record per (repo id, branch) slot.
///
/// ```text
/// TABLE analysis_records {
///   slot_id:     STRING (unique, also the record id)
///   repo_id:     STRING (indexed)
///   branch:      STRING
///   commit_id:   STRING
///   fingerprint: STRING
///   payload:     STRING (JSON-encoded AnalysisRecord)
///   created_at:  DATETIME
/// }
/// ```
///
/// The whole record travels in `payload` so an upsert replaces it in one
/// statement.
async fn init_analysis_records_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS analysis_records SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_record_slot ON TABLE analysis_records COLUMNS slot_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_record_repo ON TABLE analysis_records COLUMNS repo_id;
    "#;
    apply(db, "analysis_records", sql).await
}

/// `step_results`: one row per (slot, commit, step).
async fn init_step_results_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS step_results SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_step_key ON TABLE step_results COLUMNS step_key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_step_slot_commit ON TABLE step_results COLUMNS slot_id, commit_id;
    "#;
    apply(db, "step_results", sql).await
}

/// `repo_states`: last observed head per repository.
async fn init_repo_states_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS repo_states SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_repo_state_id ON TABLE repo_states COLUMNS repo_id UNIQUE;
    "#;
    apply(db, "repo_states", sql).await
}

/// `runs`: checkpoint run headers.
///
/// Status transitions `running → succeeded | cache_hit | failed | cancelled`
/// are enforced by the application.
async fn init_runs_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS runs SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_run_repo ON TABLE runs COLUMNS repo_id;
    "#;
    apply(db, "runs", sql).await
}

/// `run_events`: append-only checkpoint events, unique per (run, seq).
async fn init_run_events_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS run_events SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_run_event_seq ON TABLE run_events COLUMNS run_id, seq UNIQUE;
    "#;
    apply(db, "run_events", sql).await
}
