//! Relational system of record, reference cache and storage routing for newsmirror.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsmirror_core::{
    FieldAssignment, Filter, InsertSummary, ListQuery, NewRecord, OrganizationalUnit,
    PendingCursor, Record, RecordPatch, ReferenceData, StoreError, StoreResult, SyncCursor,
    SyncLogEntry, SyncTarget, SyncedVersion, Topic, TopicRef, UnitRef,
};

pub mod adapter;
pub mod cache;
pub mod memory;
pub mod pg;
pub mod retry;

pub use adapter::{Backend, StorageAdapter, StorageMode};
pub use cache::{ReferenceCache, ReferenceSource};
pub use memory::MemoryStore;
pub use pg::{PgStore, PoolConfig};
pub use retry::{
    classify_reqwest_error, classify_sqlx_error, classify_status, reqwest_to_store_error,
    retry_with_backoff, status_to_store_error, BackoffPolicy, HttpClientConfig, RetryDisposition,
};

pub const CRATE_NAME: &str = "newsmirror-storage";

/// Operations every physical backend offers to the write path and the sync jobs.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Batched idempotent write keyed on `unique_id`.
    async fn insert(&self, records: &[NewRecord], allow_update: bool)
        -> StoreResult<InsertSummary>;

    /// Upsert rows read from another backend, keeping their `created_at` and `updated_at`.
    /// Sync stamps on existing rows are left alone. Returns rows written.
    async fn copy_records(&self, records: &[Record]) -> StoreResult<u64>;

    /// Partial update by natural key; `Ok(false)` when no row matched.
    async fn update(&self, unique_id: &str, patch: &RecordPatch) -> StoreResult<bool>;

    async fn get_by_unique_id(&self, unique_id: &str) -> StoreResult<Option<Record>>;

    async fn list(&self, query: &ListQuery) -> StoreResult<Vec<Record>>;

    async fn count(&self, filters: &[Filter]) -> StoreResult<u64>;

    /// Pending rows for `target` strictly after `after`, ordered by `(published_at, unique_id)`.
    async fn pending_sync(
        &self,
        target: SyncTarget,
        after: Option<&PendingCursor>,
        limit: usize,
    ) -> StoreResult<Vec<Record>>;

    async fn records_pending_sync(
        &self,
        target: SyncTarget,
        limit: usize,
    ) -> StoreResult<Vec<Record>> {
        self.pending_sync(target, None, limit).await
    }

    async fn count_pending(&self, target: SyncTarget) -> StoreResult<u64>;

    /// Stamp confirmed rows with the version that was delivered and advance the target
    /// cursor in one unit of work. Rows rewritten since they were read are left pending.
    /// Returns the rows stamped.
    async fn mark_synced(&self, target: SyncTarget, versions: &[SyncedVersion]) -> StoreResult<u64>;

    async fn sync_cursor(&self, target: SyncTarget) -> StoreResult<Option<SyncCursor>>;

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> StoreResult<()>;

    async fn recent_sync_log(
        &self,
        target: Option<SyncTarget>,
        limit: usize,
    ) -> StoreResult<Vec<SyncLogEntry>>;

    /// Current reference snapshot, loading it on first use.
    async fn reference(&self) -> StoreResult<Arc<ReferenceData>>;

    async fn reset_reference(&self);

    /// Upsert units by key and topics by code, then drop the cached snapshot.
    async fn seed_reference(
        &self,
        units: &[OrganizationalUnit],
        topics: &[Topic],
    ) -> StoreResult<(u64, u64)>;

    /// Re-copy unit key and name onto records whose copies went stale. Returns rows touched.
    async fn resync_denormalized(&self) -> StoreResult<u64>;
}

/// Maintenance structures that can be relaxed around a bulk load.
#[async_trait]
pub trait MaintenanceControl: Send + Sync {
    /// Drop per-row maintenance that is expensive at bulk volume. Never touches `unique_id` uniqueness.
    async fn relax_maintenance(&self) -> StoreResult<()>;

    /// Rebuild everything `relax_maintenance` removed and reconcile denormalized columns.
    async fn restore_maintenance(&self) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TopicSlot {
    L1,
    L2,
    L3,
    MostSpecific,
}

impl TopicSlot {
    pub(crate) fn column(self) -> &'static str {
        match self {
            TopicSlot::L1 => "topic_l1_id",
            TopicSlot::L2 => "topic_l2_id",
            TopicSlot::L3 => "topic_l3_id",
            TopicSlot::MostSpecific => "most_specific_topic_id",
        }
    }
}

/// A patch assignment lowered to a column write, with unit and topic codes resolved.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResolvedAssignment {
    Text(&'static str, Option<String>),
    Tags(Vec<String>),
    Timestamp(&'static str, Option<DateTime<Utc>>),
    Unit(UnitRef),
    Topic(TopicSlot, Option<TopicRef>),
}

pub(crate) fn resolve_patch(
    refs: &ReferenceData,
    patch: &RecordPatch,
) -> StoreResult<Vec<ResolvedAssignment>> {
    let topic = |slot: TopicSlot, code: &Option<String>| -> StoreResult<ResolvedAssignment> {
        match code {
            None => Ok(ResolvedAssignment::Topic(slot, None)),
            Some(code) => refs
                .resolve_topic(Some(code))
                .map(|t| ResolvedAssignment::Topic(slot, Some(t)))
                .ok_or_else(|| StoreError::invalid(format!("unknown topic code {code:?}"))),
        }
    };
    patch
        .assignments()
        .iter()
        .map(|assignment| {
            let column = assignment.column();
            Ok(match assignment {
                FieldAssignment::Title(v) => ResolvedAssignment::Text(column, Some(v.clone())),
                FieldAssignment::Url(v)
                | FieldAssignment::ImageUrl(v)
                | FieldAssignment::VideoUrl(v)
                | FieldAssignment::Category(v)
                | FieldAssignment::Body(v)
                | FieldAssignment::EditorialLead(v)
                | FieldAssignment::Subtitle(v)
                | FieldAssignment::Summary(v) => ResolvedAssignment::Text(column, v.clone()),
                FieldAssignment::Tags(v) => ResolvedAssignment::Tags(v.clone()),
                FieldAssignment::PublishedAt(v) => ResolvedAssignment::Timestamp(column, Some(*v)),
                FieldAssignment::SourceUpdatedAt(v) | FieldAssignment::ExtractedAt(v) => {
                    ResolvedAssignment::Timestamp(column, *v)
                }
                FieldAssignment::OrgUnit(key) => ResolvedAssignment::Unit(refs.resolve_unit(key)?),
                FieldAssignment::TopicL1(code) => topic(TopicSlot::L1, code)?,
                FieldAssignment::TopicL2(code) => topic(TopicSlot::L2, code)?,
                FieldAssignment::TopicL3(code) => topic(TopicSlot::L3, code)?,
                FieldAssignment::MostSpecificTopic(code) => topic(TopicSlot::MostSpecific, code)?,
            })
        })
        .collect()
}

/// Validate a batch and collapse repeated ids before any backend sees it.
pub(crate) fn prepare_batch<'a>(
    refs: &ReferenceData,
    records: &'a [NewRecord],
) -> StoreResult<Vec<(&'a NewRecord, UnitRef)>> {
    if records.is_empty() {
        return Err(StoreError::invalid("insert requires at least one record"));
    }
    newsmirror_core::dedup_by_unique_id(records)
        .into_iter()
        .map(|record| {
            record.validate()?;
            let unit = refs.resolve_unit(&record.org_unit_key)?;
            Ok((record, unit))
        })
        .collect()
}
