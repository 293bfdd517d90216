//! Cache manager: keyed lookup, invalidation reasons and step-granular
//! persistence on top of an [`AnalysisStore`].
//!
//! A record is valid for a [`CacheKey`] only when branch, commit and
//! fingerprint match exactly and its TTL has not elapsed. Writes for one
//! (repo id, branch) slot are serialised through a per-slot lock; the store
//! itself guarantees each write is atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetscope_state::{
    AnalysisRecord, AnalysisStore, Fingerprint, RecordSlot, RepositoryState, RunId, StepResult,
    StorageError, StorageResult,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{CachePolicy, FleetConfig, RetryPolicy};
use crate::domain::{ForceFlags, RepoHead};
use crate::metrics::METRICS;
use crate::retry::retry_with_backoff;

/// Composite cache identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub repo_id: String,
    pub branch: String,
    pub commit_id: String,
    pub fingerprint: Fingerprint,
}

impl CacheKey {
    pub fn slot(&self) -> RecordSlot {
        RecordSlot::new(self.repo_id.clone(), self.branch.clone())
    }

    /// Stable digest of all four components.
    pub fn digest(&self) -> String {
        Fingerprint::compute([
            self.repo_id.as_str(),
            self.branch.as_str(),
            self.commit_id.as_str(),
            self.fingerprint.as_str(),
        ])
        .to_string()
    }

    fn matches(&self, record: &AnalysisRecord) -> bool {
        record.repo_id == self.repo_id
            && record.branch == self.branch
            && record.commit_id == self.commit_id
            && record.fingerprint == self.fingerprint
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}#{} ({})",
            self.repo_id,
            self.branch,
            self.commit_id,
            self.fingerprint.short()
        )
    }
}

/// Why a lookup hit or missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidationReason {
    Ok,
    NoRecord,
    Forced,
    StepForced,
    CommitChanged,
    BranchChanged,
    VersionChanged,
    TtlExpired,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationReason::Ok => "OK",
            InvalidationReason::NoRecord => "NO_RECORD",
            InvalidationReason::Forced => "FORCED",
            InvalidationReason::StepForced => "STEP_FORCED",
            InvalidationReason::CommitChanged => "COMMIT_CHANGED",
            InvalidationReason::BranchChanged => "BRANCH_CHANGED",
            InvalidationReason::VersionChanged => "VERSION_CHANGED",
            InvalidationReason::TtlExpired => "TTL_EXPIRED",
        }
    }
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(AnalysisRecord),
    Miss {
        reason: InvalidationReason,
        /// Live record of the same slot, kept for step reuse.
        previous: Option<AnalysisRecord>,
    },
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn reason(&self) -> InvalidationReason {
        match self {
            CacheLookup::Hit(_) => InvalidationReason::Ok,
            CacheLookup::Miss { reason, .. } => *reason,
        }
    }
}

pub struct CacheManager {
    store: Arc<dyn AnalysisStore>,
    ttl: chrono::Duration,
    policy: CachePolicy,
    retry: RetryPolicy,
    slot_locks: Mutex<HashMap<RecordSlot, Arc<Mutex<()>>>>,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        ttl: chrono::Duration,
        policy: CachePolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ttl,
            policy,
            retry,
            slot_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(store: Arc<dyn AnalysisStore>, config: &FleetConfig) -> Self {
        Self::new(
            store,
            config.cache_ttl,
            config.cache_policy,
            config.persistence_retry.clone(),
        )
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    pub fn store_handle(&self) -> Arc<dyn AnalysisStore> {
        Arc::clone(&self.store)
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.ttl
    }

    /// Deterministic key for a repository head and pipeline fingerprint.
    pub fn compute_key(&self, head: &RepoHead, fingerprint: &Fingerprint) -> CacheKey {
        CacheKey {
            repo_id: head.repo_id.clone(),
            branch: head.branch.clone(),
            commit_id: head.commit_id.clone(),
            fingerprint: fingerprint.clone(),
        }
    }

    /// Compare a stored record against the key.
    ///
    /// Checks run in order: branch, commit, fingerprint, TTL.
    pub fn invalidate_reason(
        key: &CacheKey,
        stored: Option<&AnalysisRecord>,
        now: DateTime<Utc>,
    ) -> InvalidationReason {
        let Some(record) = stored else {
            return InvalidationReason::NoRecord;
        };
        if record.repo_id != key.repo_id {
            return InvalidationReason::NoRecord;
        }
        if record.branch != key.branch {
            return InvalidationReason::BranchChanged;
        }
        if record.commit_id != key.commit_id {
            return InvalidationReason::CommitChanged;
        }
        if record.fingerprint != key.fingerprint {
            return InvalidationReason::VersionChanged;
        }
        if record.is_expired(now) {
            return InvalidationReason::TtlExpired;
        }
        InvalidationReason::Ok
    }

    /// Read the live record for the key's slot.
    pub async fn fetch(&self, slot: &RecordSlot) -> StorageResult<Option<AnalysisRecord>> {
        retry_with_backoff(&self.retry, "cache.get_record", || self.store.get_record(slot)).await
    }

    /// Decide hit or miss for `key`.
    ///
    /// Global force misses without touching the store. A per-step force on
    /// an otherwise valid record is a `STEP_FORCED` miss carrying the record.
    pub async fn lookup(&self, key: &CacheKey, force: &ForceFlags) -> StorageResult<CacheLookup> {
        if force.global {
            METRICS.inc_cache_misses();
            return Ok(CacheLookup::Miss {
                reason: InvalidationReason::Forced,
                previous: None,
            });
        }

        let slot = key.slot();
        let record = self.fetch(&slot).await?;
        let lookup = match record {
            None => {
                let other_branch = retry_with_backoff(&self.retry, "cache.latest_record", || {
                    self.store.latest_record(&key.repo_id)
                })
                .await?;
                CacheLookup::Miss {
                    reason: Self::invalidate_reason(key, other_branch.as_ref(), Utc::now()),
                    previous: None,
                }
            }
            Some(record) => match Self::invalidate_reason(key, Some(&record), Utc::now()) {
                InvalidationReason::Ok if force.step.is_some() => CacheLookup::Miss {
                    reason: InvalidationReason::StepForced,
                    previous: Some(record),
                },
                InvalidationReason::Ok => CacheLookup::Hit(record),
                reason => CacheLookup::Miss {
                    reason,
                    previous: Some(record),
                },
            },
        };

        if lookup.is_hit() {
            METRICS.inc_cache_hits();
        } else {
            METRICS.inc_cache_misses();
        }
        debug!(key = %key, reason = %lookup.reason(), "cache lookup");
        Ok(lookup)
    }

    /// Previously stored step results usable at `key`'s commit.
    ///
    /// Sources are the previous record (same commit only) and the steps
    /// persisted individually for the commit; the newer result wins. Expired
    /// results and the force target are excluded, and global force reuses
    /// nothing. Template versions are checked by the executor.
    pub async fn reusable_steps(
        &self,
        key: &CacheKey,
        previous: Option<&AnalysisRecord>,
        force: &ForceFlags,
    ) -> StorageResult<BTreeMap<String, StepResult>> {
        let mut reusable = BTreeMap::new();
        if force.global {
            return Ok(reusable);
        }

        if let Some(record) = previous {
            if record.commit_id == key.commit_id && record.branch == key.branch {
                for step in &record.steps {
                    reusable.insert(step.step_id.clone(), step.clone());
                }
            }
        }
        for step in self.load_steps(key).await? {
            let newer = reusable
                .get(&step.step_id)
                .map(|existing: &StepResult| step.generated_at >= existing.generated_at)
                .unwrap_or(true);
            if newer {
                reusable.insert(step.step_id.clone(), step);
            }
        }

        let now = Utc::now();
        reusable.retain(|id, step| {
            force.step.as_deref() != Some(id.as_str()) && step.generated_at + self.ttl > now
        });
        Ok(reusable)
    }

    /// Step results persisted for the key's commit.
    pub async fn load_steps(&self, key: &CacheKey) -> StorageResult<Vec<StepResult>> {
        let slot = key.slot();
        retry_with_backoff(&self.retry, "cache.list_steps", || {
            self.store.list_steps(&slot, &key.commit_id)
        })
        .await
    }

    /// Persist one completed step immediately.
    pub async fn persist_step(&self, key: &CacheKey, result: &StepResult) -> StorageResult<()> {
        let slot = key.slot();
        let lock = self.slot_lock(&slot).await;
        let _guard = lock.lock().await;
        retry_with_backoff(&self.retry, "cache.put_step", || {
            self.store.put_step(&slot, &key.commit_id, result)
        })
        .await
    }

    /// Build the record a completed pipeline materialises.
    pub fn build_record(
        &self,
        key: &CacheKey,
        category: &str,
        steps: Vec<StepResult>,
        run_id: RunId,
    ) -> AnalysisRecord {
        let now = Utc::now();
        AnalysisRecord {
            repo_id: key.repo_id.clone(),
            branch: key.branch.clone(),
            commit_id: key.commit_id.clone(),
            fingerprint: key.fingerprint.clone(),
            category: category.to_string(),
            steps,
            run_id,
            created_at: now,
            expires_at: self.expires_at(now),
        }
    }

    /// Upsert the record for the key's slot; latest wins.
    pub async fn store(&self, key: &CacheKey, record: &AnalysisRecord) -> StorageResult<()> {
        if !key.matches(record) {
            return Err(StorageError::Serialization(format!(
                "record for {}@{}#{} does not match key {key}",
                record.repo_id, record.branch, record.commit_id
            )));
        }
        let slot = key.slot();
        let lock = self.slot_lock(&slot).await;
        let _guard = lock.lock().await;
        retry_with_backoff(&self.retry, "cache.put_record", || self.store.put_record(record)).await
    }

    /// Refresh the repository state after an investigation.
    pub async fn record_state(&self, head: &RepoHead, analyzed: bool) -> StorageResult<()> {
        let now = Utc::now();
        let previous = retry_with_backoff(&self.retry, "cache.get_repo_state", || {
            self.store.get_repo_state(&head.repo_id)
        })
        .await?;
        let state = RepositoryState {
            repo_id: head.repo_id.clone(),
            branch: head.branch.clone(),
            commit_id: head.commit_id.clone(),
            last_analyzed_at: if analyzed {
                Some(now)
            } else {
                previous.and_then(|p| p.last_analyzed_at)
            },
            updated_at: now,
        };
        retry_with_backoff(&self.retry, "cache.put_repo_state", || {
            self.store.put_repo_state(&state)
        })
        .await
    }

    /// Drop step results of commits other than the key's.
    /// Drop step results from older commits. Ends the slot's write
    /// sequence, so its lock entry is released here as well.
    pub async fn prune(&self, key: &CacheKey) -> StorageResult<()> {
        let slot = key.slot();
        let lock = self.slot_lock(&slot).await;
        let result = {
            let _guard = lock.lock().await;
            self.store.prune_steps(&slot, &key.commit_id).await
        };
        self.release_slot_lock(&slot, lock).await;
        result
    }

    pub async fn ping(&self) -> StorageResult<()> {
        self.store.ping().await
    }

    async fn slot_lock(&self, slot: &RecordSlot) -> Arc<Mutex<()>> {
        let mut locks = self.slot_locks.lock().await;
        Arc::clone(locks.entry(slot.clone()).or_default())
    }

    async fn release_slot_lock(&self, slot: &RecordSlot, lock: Arc<Mutex<()>>) {
        let mut locks = self.slot_locks.lock().await;
        // the map's reference plus ours; clones only happen under `locks`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetscope_state::fakes::{FaultyStore, MemoryAnalysisStore};

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::from_bytes(tag.as_bytes())
    }

    fn head(commit: &str) -> RepoHead {
        RepoHead {
            repo_id: "svc".into(),
            branch: "main".into(),
            commit_id: commit.into(),
        }
    }

    fn step(id: &str, version: u32) -> StepResult {
        StepResult {
            step_id: id.into(),
            content: format!("{id} findings"),
            generated_at: Utc::now(),
            template_version: version,
            applicable: true,
            usage: Default::default(),
        }
    }

    fn manager(store: Arc<dyn AnalysisStore>) -> CacheManager {
        CacheManager::new(
            store,
            chrono::Duration::days(30),
            CachePolicy::FailClosed,
            RetryPolicy::immediate(2),
        )
    }

    #[test]
    fn reasons_are_checked_in_order() {
        let cache = manager(Arc::new(MemoryAnalysisStore::new()));
        let key = cache.compute_key(&head("abc123"), &fp("v1"));
        let record = cache.build_record(&key, "backend", vec![], RunId::new());
        let now = Utc::now();

        assert_eq!(
            CacheManager::invalidate_reason(&key, Some(&record), now),
            InvalidationReason::Ok
        );
        assert_eq!(
            CacheManager::invalidate_reason(&key, None, now),
            InvalidationReason::NoRecord
        );

        let changed = cache.compute_key(&head("def456"), &fp("v1"));
        assert_eq!(
            CacheManager::invalidate_reason(&changed, Some(&record), now),
            InvalidationReason::CommitChanged
        );

        let bumped = cache.compute_key(&head("abc123"), &fp("v2"));
        assert_eq!(
            CacheManager::invalidate_reason(&bumped, Some(&record), now),
            InvalidationReason::VersionChanged
        );

        let mut other_branch = key.clone();
        other_branch.branch = "develop".into();
        other_branch.commit_id = "def456".into();
        assert_eq!(
            CacheManager::invalidate_reason(&other_branch, Some(&record), now),
            InvalidationReason::BranchChanged
        );

        let later = now + chrono::Duration::days(31);
        assert_eq!(
            CacheManager::invalidate_reason(&key, Some(&record), later),
            InvalidationReason::TtlExpired
        );
    }

    #[test]
    fn key_digest_is_stable() {
        let cache = manager(Arc::new(MemoryAnalysisStore::new()));
        let a = cache.compute_key(&head("abc123"), &fp("v1"));
        let b = cache.compute_key(&head("abc123"), &fp("v1"));
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), cache.compute_key(&head("def456"), &fp("v1")).digest());
    }

    #[tokio::test]
    async fn store_then_lookup_hits() {
        let cache = manager(Arc::new(MemoryAnalysisStore::new()));
        let key = cache.compute_key(&head("abc123"), &fp("v1"));
        let record = cache.build_record(&key, "libraries", vec![step("overview", 1)], RunId::new());
        cache.store(&key, &record).await.unwrap();

        let lookup = cache.lookup(&key, &ForceFlags::none()).await.unwrap();
        assert_eq!(lookup, CacheLookup::Hit(record));
    }

    #[tokio::test]
    async fn global_force_never_reads() {
        let store = Arc::new(FaultyStore::unavailable());
        let cache = manager(store);
        let key = cache.compute_key(&head("abc123"), &fp("v1"));
        let force = ForceFlags {
            global: true,
            step: None,
        };
        let lookup = cache.lookup(&key, &force).await.unwrap();
        assert_eq!(lookup.reason(), InvalidationReason::Forced);
    }

    #[tokio::test]
    async fn step_force_misses_with_previous() {
        let cache = manager(Arc::new(MemoryAnalysisStore::new()));
        let key = cache.compute_key(&head("abc123"), &fp("v1"));
        let record = cache.build_record(
            &key,
            "backend",
            vec![step("overview", 1), step("security", 1)],
            RunId::new(),
        );
        cache.store(&key, &record).await.unwrap();

        let force = ForceFlags {
            global: false,
            step: Some("security".into()),
        };
        let lookup = cache.lookup(&key, &force).await.unwrap();
        let CacheLookup::Miss { reason, previous } = lookup else {
            panic!("expected miss");
        };
        assert_eq!(reason, InvalidationReason::StepForced);

        let reusable = cache
            .reusable_steps(&key, previous.as_ref(), &force)
            .await
            .unwrap();
        assert!(reusable.contains_key("overview"));
        assert!(!reusable.contains_key("security"));
    }

    #[tokio::test]
    async fn branch_switch_reports_branch_changed() {
        let cache = manager(Arc::new(MemoryAnalysisStore::new()));
        let key = cache.compute_key(&head("abc123"), &fp("v1"));
        let record = cache.build_record(&key, "backend", vec![], RunId::new());
        cache.store(&key, &record).await.unwrap();

        let dev = cache.compute_key(
            &RepoHead {
                repo_id: "svc".into(),
                branch: "develop".into(),
                commit_id: "abc123".into(),
            },
            &fp("v1"),
        );
        let lookup = cache.lookup(&dev, &ForceFlags::none()).await.unwrap();
        assert_eq!(lookup.reason(), InvalidationReason::BranchChanged);
        assert!(matches!(lookup, CacheLookup::Miss { previous: None, .. }));
    }

    #[tokio::test]
    async fn persisted_steps_are_reusable_at_same_commit_only() {
        let cache = manager(Arc::new(MemoryAnalysisStore::new()));
        let key = cache.compute_key(&head("abc123"), &fp("v1"));
        cache.persist_step(&key, &step("overview", 1)).await.unwrap();

        let reusable = cache
            .reusable_steps(&key, None, &ForceFlags::none())
            .await
            .unwrap();
        assert_eq!(reusable.len(), 1);

        let moved = cache.compute_key(&head("def456"), &fp("v1"));
        let reusable = cache
            .reusable_steps(&moved, None, &ForceFlags::none())
            .await
            .unwrap();
        assert!(reusable.is_empty());
    }

    #[tokio::test]
    async fn prune_releases_the_slot_lock() {
        let cache = manager(Arc::new(MemoryAnalysisStore::new()));
        let old = cache.compute_key(&head("abc123"), &fp("v1"));
        let key = cache.compute_key(&head("def456"), &fp("v1"));
        cache.persist_step(&old, &step("overview", 1)).await.unwrap();
        cache.persist_step(&key, &step("overview", 1)).await.unwrap();
        assert_eq!(cache.slot_locks.lock().await.len(), 1);

        cache.prune(&key).await.unwrap();

        assert!(cache.slot_locks.lock().await.is_empty());
        assert!(cache
            .reusable_steps(&old, None, &ForceFlags::none())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            cache
                .reusable_steps(&key, None, &ForceFlags::none())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn mismatched_record_is_rejected() {
        let cache = manager(Arc::new(MemoryAnalysisStore::new()));
        let key = cache.compute_key(&head("abc123"), &fp("v1"));
        let other = cache.compute_key(&head("def456"), &fp("v1"));
        let record = cache.build_record(&other, "backend", vec![], RunId::new());
        assert!(cache.store(&key, &record).await.is_err());
    }

    #[tokio::test]
    async fn unavailable_store_surfaces_error() {
        let cache = manager(Arc::new(FaultyStore::unavailable()));
        let key = cache.compute_key(&head("abc123"), &fp("v1"));
        let err = cache.lookup(&key, &ForceFlags::none()).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert!(cache.ping().await.is_err());
    }

    #[tokio::test]
    async fn record_state_keeps_last_analyzed_on_refresh() {
        let store = Arc::new(MemoryAnalysisStore::new());
        let cache = manager(store.clone());
        cache.record_state(&head("abc123"), true).await.unwrap();
        let first = store.get_repo_state("svc").await.unwrap().unwrap();
        cache.record_state(&head("abc123"), false).await.unwrap();
        let second = store.get_repo_state("svc").await.unwrap().unwrap();
        assert_eq!(first.last_analyzed_at, second.last_analyzed_at);
        assert!(second.updated_at >= first.updated_at);
    }
}
