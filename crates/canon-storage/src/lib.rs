//! Persistence collaborators for canon: store traits, backends, search index and fetch utilities.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use canon_core::{
    Entity, EntityId, IngestEntry, MappingRecord, Nonce, PendingItem, RefCounts, StatusReport,
    Stub, StoredStub, StubId, WorkKind,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub mod fetch;
pub mod mapping;
pub mod memory;
pub mod postgres;
pub mod search;

pub use fetch::{
    ArchivedDocument, DocumentArchive, DocumentSource, FetchError, FetchedDocument,
    FixtureSource, HttpClientConfig, HttpFetcher,
};
pub use mapping::{stub_for_resource, ExpansionPolicy, ExpansionSummary, MappingStore};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use search::{IndexedDocument, MemoryIndex, PgSearchIndex, SearchIndex, SearchQuery};

pub const CRATE_NAME: &str = "canon-storage";

/// SQLSTATEs treated as transient: serialization_failure, deadlock_detected, lock_not_available.
pub const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: usize,
        last: String,
    },
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::Database(db) => db
                .code()
                .map(|code| is_transient_sqlstate(code.as_ref()))
                .unwrap_or(false),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
            _ => false,
        };
        if transient {
            StoreError::Transient(err.to_string())
        } else {
            StoreError::Database(err)
        }
    }
}

pub fn is_transient_sqlstate(code: &str) -> bool {
    TRANSIENT_SQLSTATES.contains(&code)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails non-transiently, or exhausts `policy.max_retries`.
pub async fn with_retry<T, F, Fut>(
    operation: &'static str,
    policy: &BackoffPolicy,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                if attempt >= policy.max_retries {
                    return Err(StoreError::RetriesExhausted {
                        operation,
                        attempts: attempt + 1,
                        last: err.to_string(),
                    });
                }
                warn!(operation, attempt, error = %err, "transient store failure; retrying");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A stub that claims a target, with its persisted creation time if it has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubClaim {
    pub stub: StubId,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingDiff {
    pub inserted: usize,
    pub deleted: usize,
}

impl MappingDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.deleted == 0
    }
}

/// Keys of rows to delete and rows to insert so that `existing` becomes `desired`.
///
/// Duplicate existing rows beyond the first are deleted; duplicate desired rows collapse.
pub fn diff_mappings<K: Copy>(
    existing: &[(K, StubId, MappingRecord)],
    desired: &[(StubId, MappingRecord)],
) -> (Vec<K>, Vec<(StubId, MappingRecord)>) {
    let want: HashSet<(StubId, &MappingRecord)> = desired.iter().map(|(a, r)| (*a, r)).collect();
    let mut kept: HashSet<(StubId, &MappingRecord)> = HashSet::new();
    let mut delete = Vec::new();
    for (key, anchor, record) in existing {
        let row = (*anchor, record);
        if !(want.contains(&row) && kept.insert(row)) {
            delete.push(*key);
        }
    }
    let mut insert = Vec::new();
    let mut queued: HashSet<(StubId, &MappingRecord)> = HashSet::new();
    for (anchor, record) in desired {
        let row = (*anchor, record);
        if !kept.contains(&row) && queued.insert(row) {
            insert.push((*anchor, record.clone()));
        }
    }
    (delete, insert)
}

/// Every committed record must be attributed to the evaluated entity.
pub fn check_commit(related: EntityId, records: &[MappingRecord]) -> Result<(), StoreError> {
    for record in records {
        match record.related_entity {
            Some(id) if id == related => {}
            Some(other) => {
                return Err(StoreError::Invariant(format!(
                    "mapping {} belongs to {other}, not {related}",
                    record.resource
                )))
            }
            None => {
                return Err(StoreError::Invariant(format!(
                    "mapping {} has no related entity",
                    record.resource
                )))
            }
        }
        if record.local {
            return Err(StoreError::Invariant(format!(
                "curated mapping {} cannot be committed by evaluation",
                record.resource
            )));
        }
    }
    Ok(())
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert or replace; the first-seen creation time is kept.
    async fn put_entity(&self, entity: &Entity) -> Result<(), StoreError>;
    async fn entity(&self, id: EntityId) -> Result<Option<Entity>, StoreError>;
    async fn entity_by_iri(&self, iri: &str) -> Result<Option<Entity>, StoreError>;
    async fn entity_ids(&self) -> Result<Vec<EntityId>, StoreError>;
    /// Recorded default anchor, or `candidate` after recording it.
    async fn default_anchor(&self, entity: EntityId, candidate: StubId)
        -> Result<StubId, StoreError>;
}

#[async_trait]
pub trait MappingTable: Send + Sync {
    async fn mappings_for_anchor(&self, anchor: StubId) -> Result<Vec<MappingRecord>, StoreError>;
    /// Stubs holding an exactMatch on `resource` or on `entity`.
    async fn claims_for(
        &self,
        resource: &str,
        entity: Option<EntityId>,
    ) -> Result<Vec<StubClaim>, StoreError>;
    /// Anchor holding the entity's own self-evidence.
    async fn anchor_of_entity(&self, entity: EntityId) -> Result<Option<StubId>, StoreError>;
    /// Make the global rows attributed to `related` under `anchor` (and `previous`) equal `records`.
    async fn apply_mappings(
        &self,
        anchor: StubId,
        previous: Option<StubId>,
        related: EntityId,
        records: &[MappingRecord],
    ) -> Result<MappingDiff, StoreError>;
    /// Replace every row of (anchor, source) in the records' table with `records`.
    async fn map_resource(
        &self,
        anchor: StubId,
        source: &str,
        local: bool,
        records: &[MappingRecord],
    ) -> Result<MappingDiff, StoreError>;
    async fn remove_entity_mappings(
        &self,
        anchor: StubId,
        related: EntityId,
    ) -> Result<usize, StoreError>;
    async fn remove_mapping(&self, anchor: StubId, resource: &str) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait StubStore: Send + Sync {
    /// Persist the stub and recompute its reference counters in one transaction.
    async fn put_stub(&self, stub: &Stub) -> Result<StoredStub, StoreError>;
    async fn stub(&self, id: StubId) -> Result<Option<StoredStub>, StoreError>;
    /// Remove the stub and every mapping row anchored on it.
    async fn delete_stub(&self, id: StubId) -> Result<bool, StoreError>;
    async fn refresh_ref_counts(&self, id: StubId) -> Result<Option<RefCounts>, StoreError>;
    async fn stub_ids(&self) -> Result<Vec<StubId>, StoreError>;
}

/// Nonce-guarded pending-work markers, one per (id, kind).
#[async_trait]
pub trait DirtyTracker: Send + Sync {
    async fn mark_dirty(&self, id: Uuid, kind: WorkKind) -> Result<Nonce, StoreError>;
    /// Clears the marker only while it still carries `nonce`.
    async fn mark_clean(&self, id: Uuid, kind: WorkKind, nonce: &Nonce)
        -> Result<bool, StoreError>;
    async fn pending(
        &self,
        kind: Option<WorkKind>,
        limit: usize,
    ) -> Result<Vec<PendingItem>, StoreError>;
    async fn is_dirty(&self, id: Uuid, kind: WorkKind) -> Result<bool, StoreError>;
    /// Mark every known item of `kind` dirty.
    async fn reset(&self, kind: WorkKind) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait IngestQueue: Send + Sync {
    /// Returns false when an entry for (anchor, uri) already exists and `always` is unset.
    async fn queue_ingest(&self, entry: &IngestEntry, always: bool) -> Result<bool, StoreError>;
    async fn next_ingest_anchor(&self, now: DateTime<Utc>) -> Result<Option<Uuid>, StoreError>;
    async fn ingest_entries(
        &self,
        anchor: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<IngestEntry>, StoreError>;
    async fn ingest_entries_for_uri(
        &self,
        uri: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<IngestEntry>, StoreError>;
    async fn remove_ingest(&self, anchor: Uuid, uri: &str) -> Result<(), StoreError>;
    async fn delay_ingest(
        &self,
        anchor: Uuid,
        uri: &str,
        until: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: EntityStore + MappingTable + StubStore + DirtyTracker + IngestQueue {
    async fn status(&self) -> Result<StatusReport, StoreError>;

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use canon_core::MatchType;

    fn fast_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn sqlstates_classify() {
        assert!(is_transient_sqlstate("40001"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let value = with_retry("test", &fast_policy(5), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Transient("serialization failure".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .expect("third attempt succeeds");
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_bound() {
        let err = with_retry("test", &fast_policy(2), || async {
            Err::<(), _>(StoreError::Transient("deadlock".into()))
        })
        .await
        .expect_err("never succeeds");
        assert!(matches!(err, StoreError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn retry_does_not_repeat_fatal_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = with_retry("test", &fast_policy(5), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Invariant("broken".into()))
            }
        })
        .await
        .expect_err("fatal");
        assert!(matches!(err, StoreError::Invariant(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn diff_applies_minimal_changes() {
        let anchor = Uuid::new_v4();
        let keep = MappingRecord::new("http://a/keep", MatchType::ExactMatch, 100);
        let gone = MappingRecord::new("http://a/gone", MatchType::CloseMatch, 65);
        let new = MappingRecord::new("http://a/new", MatchType::BroadMatch, 40);
        let existing = vec![
            (1, anchor, keep.clone()),
            (2, anchor, gone.clone()),
            (3, anchor, keep.clone()),
        ];
        let desired = vec![(anchor, keep.clone()), (anchor, new.clone()), (anchor, new.clone())];
        let (delete, insert) = diff_mappings(&existing, &desired);
        assert_eq!(delete, vec![2, 3]);
        assert_eq!(insert, vec![(anchor, new)]);
    }

    #[test]
    fn commit_requires_related_entity() {
        let related = Uuid::new_v4();
        let record = MappingRecord::new("http://a/x", MatchType::ExactMatch, 100);
        assert!(matches!(
            check_commit(related, &[record.clone()]),
            Err(StoreError::Invariant(_))
        ));
        assert!(check_commit(related, &[record.with_related(related)]).is_ok());
    }
}
