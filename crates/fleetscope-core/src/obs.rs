//! Structured observability hooks for investigation lifecycle events.
//!
//! One emission function per event. Every event carries an
//! `event = "<name>"` field for log filtering; controller futures run inside
//! a `fleetscope.repo` span tagged with repo id and pass number.

use std::fmt::Display;
use std::time::Duration;

use tracing::{info, warn};

pub fn emit_repo_started(repo_id: &str, branch: &str, forced: bool) {
    info!(event = "repo.started", repo = %repo_id, branch = %branch, forced = forced);
}

pub fn emit_phase(repo_id: &str, phase: &str) {
    info!(event = "repo.phase", repo = %repo_id, phase = %phase);
}

pub fn emit_cache_decision(repo_id: &str, commit_id: &str, hit: bool, reason: &str) {
    info!(
        event = "repo.cache_decision",
        repo = %repo_id,
        commit = %commit_id,
        hit = hit,
        reason = %reason,
    );
}

pub fn emit_classified(repo_id: &str, category: &str, confidence: f64, overridden: bool) {
    info!(
        event = "repo.classified",
        repo = %repo_id,
        category = %category,
        confidence = confidence,
        overridden = overridden,
    );
}

pub fn emit_step_completed(step_id: &str, index: usize, total: usize, reused: bool, applicable: bool) {
    info!(
        event = "step.completed",
        step = %step_id,
        index = index,
        total = total,
        reused = reused,
        applicable = applicable,
    );
}

pub fn emit_retry(operation: &str, attempt: u32, delay: Duration, error: &dyn Display) {
    warn!(
        event = "call.retry",
        operation = %operation,
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
    );
}

pub fn emit_repo_finished(repo_id: &str, outcome: &str, duration_ms: u64) {
    info!(event = "repo.finished", repo = %repo_id, outcome = %outcome, duration_ms = duration_ms);
}

/// Cleanup failures are reported but never fail the repository.
pub fn emit_cleanup_error(repo_id: &str, error: &dyn Display) {
    warn!(event = "repo.cleanup_error", repo = %repo_id, error = %error);
}

/// Cache or checkpoint writes that were skipped under a fail-open policy.
pub fn emit_degraded_write(repo_id: &str, what: &str, error: &dyn Display) {
    warn!(event = "repo.degraded_write", repo = %repo_id, what = %what, error = %error);
}

pub fn emit_pass_started(pass: u64, repos: usize, chunks: usize) {
    info!(event = "fleet.pass_started", pass = pass, repos = repos, chunks = chunks);
}

pub fn emit_chunk_settled(pass: u64, chunk: usize, size: usize, failed: usize) {
    info!(event = "fleet.chunk_settled", pass = pass, chunk = chunk, size = size, failed = failed);
}

pub fn emit_pass_finished(pass: u64, succeeded: usize, failed: usize, cache_hits: usize, duration_ms: u64) {
    info!(
        event = "fleet.pass_finished",
        pass = pass,
        succeeded = succeeded,
        failed = failed,
        cache_hits = cache_hits,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitters_do_not_panic_without_subscriber() {
        emit_phase("test-repo", "cache_check");
        emit_retry("analysis.overview", 1, Duration::from_millis(5), &"503");
        emit_pass_finished(1, 2, 0, 1, 10);
    }
}
