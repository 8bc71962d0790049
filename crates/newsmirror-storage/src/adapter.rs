//! Mode-driven routing of logical reads and writes over a primary and an optional shadow backend.
//!
//! Writes always land on the primary first. In dual-write mode the shadow is
//! written afterwards and any failure there is logged, counted and queued for
//! [`StorageAdapter::repair_shadow`]; it never fails the logical write. Reads use
//! exactly one backend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use newsmirror_core::{
    Filter, InsertSummary, ListQuery, NewRecord, OrganizationalUnit, PendingCursor, Record,
    RecordPatch, ReferenceData, StoreError, StoreResult, SyncCursor, SyncLogEntry, SyncTarget,
    SyncedVersion, Topic,
};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Primary,
    Shadow,
}

impl FromStr for Backend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Backend::Primary),
            "shadow" => Ok(Backend::Shadow),
            other => Err(StoreError::invalid(format!("unknown backend {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    PrimaryOnly,
    DualWrite { read_from: Backend },
    /// Primary is the sole source of truth; the shadow is decommissioned.
    Cutover,
}

impl StorageMode {
    /// Build a mode from its configuration strings, rejecting combinations that cannot exist.
    pub fn parse(write_mode: &str, read_from: Option<&str>) -> StoreResult<Self> {
        let read_from = read_from
            .filter(|s| !s.trim().is_empty())
            .map(str::parse::<Backend>)
            .transpose()?;
        match (write_mode.trim().to_ascii_lowercase().as_str(), read_from) {
            ("primary-only" | "primary_only", None | Some(Backend::Primary)) => {
                Ok(StorageMode::PrimaryOnly)
            }
            ("cutover", None | Some(Backend::Primary)) => Ok(StorageMode::Cutover),
            ("dual-write" | "dual_write", read_from) => Ok(StorageMode::DualWrite {
                read_from: read_from.unwrap_or(Backend::Primary),
            }),
            (mode @ ("primary-only" | "primary_only" | "cutover"), Some(Backend::Shadow)) => {
                Err(StoreError::invalid(format!(
                    "write mode {mode:?} cannot read from the shadow backend"
                )))
            }
            (other, _) => Err(StoreError::invalid(format!("unknown write mode {other:?}"))),
        }
    }

    pub fn read_backend(self) -> Backend {
        match self {
            StorageMode::DualWrite { read_from } => read_from,
            StorageMode::PrimaryOnly | StorageMode::Cutover => Backend::Primary,
        }
    }

    pub fn writes_shadow(self) -> bool {
        matches!(self, StorageMode::DualWrite { .. })
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::PrimaryOnly => f.write_str("primary-only"),
            StorageMode::DualWrite { read_from: Backend::Primary } => {
                f.write_str("dual-write (read from primary)")
            }
            StorageMode::DualWrite { read_from: Backend::Shadow } => {
                f.write_str("dual-write (read from shadow)")
            }
            StorageMode::Cutover => f.write_str("cutover"),
        }
    }
}

pub struct StorageAdapter {
    primary: Arc<dyn RecordStore>,
    shadow: Option<Arc<dyn RecordStore>>,
    mode: RwLock<StorageMode>,
    shadow_failures: AtomicU64,
    /// Ids awaiting repair, tagged with the failure that queued them last.
    repair_queue: Mutex<BTreeMap<String, u64>>,
}

impl StorageAdapter {
    pub fn new(
        primary: Arc<dyn RecordStore>,
        shadow: Option<Arc<dyn RecordStore>>,
        mode: StorageMode,
    ) -> StoreResult<Self> {
        check_mode(mode, shadow.is_some())?;
        info!(
            %mode,
            primary = primary.backend_name(),
            shadow = shadow.as_ref().map(|s| s.backend_name()),
            "storage adapter configured"
        );
        Ok(Self {
            primary,
            shadow,
            mode: RwLock::new(mode),
            shadow_failures: AtomicU64::new(0),
            repair_queue: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn mode(&self) -> StorageMode {
        *self.mode.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Switch modes at runtime; no data moves.
    pub fn set_mode(&self, mode: StorageMode) -> StoreResult<()> {
        check_mode(mode, self.shadow.is_some())?;
        let mut current = self.mode.write().unwrap_or_else(|p| p.into_inner());
        info!(from = %*current, to = %mode, "storage mode switched");
        *current = mode;
        Ok(())
    }

    pub fn shadow_failures(&self) -> u64 {
        self.shadow_failures.load(Ordering::SeqCst)
    }

    /// Ids whose shadow copy is known to be missing or stale.
    pub fn pending_shadow_repairs(&self) -> Vec<String> {
        self.queue().keys().cloned().collect()
    }

    /// Re-copy queued rows from the primary. Returns how many were repaired.
    ///
    /// Rows keep the primary's timestamps and the shadow's sync watermarks are left alone.
    /// An id that fails again while the pass runs stays queued.
    pub async fn repair_shadow(&self) -> StoreResult<u64> {
        let Some(shadow) = &self.shadow else {
            return Ok(0);
        };
        let queued = self.queued_repairs();
        let mut copies = Vec::with_capacity(queued.len());
        for (id, _) in &queued {
            if let Some(record) = self.primary.get_by_unique_id(id).await? {
                copies.push(record);
            }
        }
        if !copies.is_empty() {
            shadow.copy_records(&copies).await?;
        }
        let still_queued = self.settle_repairs(&queued);
        info!(repaired = copies.len(), still_queued, "shadow repair pass finished");
        Ok(copies.len() as u64)
    }

    fn queued_repairs(&self) -> Vec<(String, u64)> {
        self.queue()
            .iter()
            .map(|(id, failure)| (id.clone(), *failure))
            .collect()
    }

    /// Drop repaired ids unless a later failure queued them again. Returns what is left.
    fn settle_repairs(&self, repaired: &[(String, u64)]) -> usize {
        let mut queue = self.queue();
        for (id, failure) in repaired {
            if queue.get(id) == Some(failure) {
                queue.remove(id);
            }
        }
        queue.len()
    }

    /// Parse a loosely typed field map and route it as an update.
    pub async fn update_fields(&self, unique_id: &str, fields: &Map<String, Value>) -> StoreResult<bool> {
        let patch = RecordPatch::from_fields(fields)?;
        self.update(unique_id, &patch).await
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, u64>> {
        self.repair_queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read_store(&self) -> &Arc<dyn RecordStore> {
        match (self.mode().read_backend(), &self.shadow) {
            (Backend::Shadow, Some(shadow)) => shadow,
            _ => &self.primary,
        }
    }

    /// The written backend that reads do not use, if any.
    fn unread_backend(&self) -> Option<&Arc<dyn RecordStore>> {
        let shadow = self.shadow_for_write()?;
        match self.mode().read_backend() {
            Backend::Shadow => Some(&self.primary),
            Backend::Primary => Some(shadow),
        }
    }

    fn shadow_for_write(&self) -> Option<&Arc<dyn RecordStore>> {
        if self.mode().writes_shadow() {
            self.shadow.as_ref()
        } else {
            None
        }
    }

    fn record_shadow_failure<'a>(
        &self,
        operation: &str,
        err: &StoreError,
        ids: impl IntoIterator<Item = &'a String>,
    ) {
        let failures = self.shadow_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let mut queue = self.queue();
        let mut queued = 0usize;
        for id in ids {
            queue.insert(id.clone(), failures);
            queued += 1;
        }
        warn!(
            operation,
            error = %err,
            failures,
            queued,
            "shadow write failed; primary write stands"
        );
    }
}

fn check_mode(mode: StorageMode, has_shadow: bool) -> StoreResult<()> {
    if mode.writes_shadow() && !has_shadow {
        return Err(StoreError::invalid(
            "dual-write mode requires a shadow backend",
        ));
    }
    Ok(())
}

#[async_trait]
impl RecordStore for StorageAdapter {
    fn backend_name(&self) -> &'static str {
        "adapter"
    }

    async fn insert(&self, records: &[NewRecord], allow_update: bool) -> StoreResult<InsertSummary> {
        let summary = self.primary.insert(records, allow_update).await?;
        if let Some(shadow) = self.shadow_for_write() {
            if let Err(err) = shadow.insert(records, allow_update).await {
                self.record_shadow_failure("insert", &err, records.iter().map(|r| &r.unique_id));
            }
        }
        Ok(summary)
    }

    async fn copy_records(&self, records: &[Record]) -> StoreResult<u64> {
        let written = self.primary.copy_records(records).await?;
        if let Some(shadow) = self.shadow_for_write() {
            if let Err(err) = shadow.copy_records(records).await {
                self.record_shadow_failure("copy_records", &err, records.iter().map(|r| &r.unique_id));
            }
        }
        Ok(written)
    }

    async fn update(&self, unique_id: &str, patch: &RecordPatch) -> StoreResult<bool> {
        let found = self.primary.update(unique_id, patch).await?;
        if !found {
            return Ok(false);
        }
        if let Some(shadow) = self.shadow_for_write() {
            let id = unique_id.to_string();
            match shadow.update(unique_id, patch).await {
                Ok(true) => {}
                Ok(false) => self.record_shadow_failure(
                    "update",
                    &StoreError::Internal("row missing on shadow".into()),
                    [&id],
                ),
                Err(err) => self.record_shadow_failure("update", &err, [&id]),
            }
        }
        Ok(true)
    }

    async fn get_by_unique_id(&self, unique_id: &str) -> StoreResult<Option<Record>> {
        self.read_store().get_by_unique_id(unique_id).await
    }

    async fn list(&self, query: &ListQuery) -> StoreResult<Vec<Record>> {
        self.read_store().list(query).await
    }

    async fn count(&self, filters: &[Filter]) -> StoreResult<u64> {
        self.read_store().count(filters).await
    }

    async fn pending_sync(
        &self,
        target: SyncTarget,
        after: Option<&PendingCursor>,
        limit: usize,
    ) -> StoreResult<Vec<Record>> {
        self.read_store().pending_sync(target, after, limit).await
    }

    async fn count_pending(&self, target: SyncTarget) -> StoreResult<u64> {
        self.read_store().count_pending(target).await
    }

    /// Stamps land on the backend the rows were read from. The other backend, when it is
    /// written at all, is stamped with its own current versions of the same rows.
    async fn mark_synced(&self, target: SyncTarget, versions: &[SyncedVersion]) -> StoreResult<u64> {
        let marked = self.read_store().mark_synced(target, versions).await?;
        let Some(other) = self.unread_backend() else {
            return Ok(marked);
        };
        let mirrored = async {
            let mut local = Vec::with_capacity(versions.len());
            for version in versions {
                if let Some(record) = other.get_by_unique_id(&version.unique_id).await? {
                    local.push(record.synced_version());
                }
            }
            other.mark_synced(target, &local).await
        };
        if let Err(err) = mirrored.await {
            // Watermarks are bookkeeping; no content to repair.
            self.record_shadow_failure("mark_synced", &err, std::iter::empty());
        }
        Ok(marked)
    }

    async fn sync_cursor(&self, target: SyncTarget) -> StoreResult<Option<SyncCursor>> {
        self.read_store().sync_cursor(target).await
    }

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> StoreResult<()> {
        self.primary.append_sync_log(entry).await?;
        if let Some(shadow) = self.shadow_for_write() {
            if let Err(err) = shadow.append_sync_log(entry).await {
                self.record_shadow_failure("append_sync_log", &err, std::iter::empty());
            }
        }
        Ok(())
    }

    async fn recent_sync_log(
        &self,
        target: Option<SyncTarget>,
        limit: usize,
    ) -> StoreResult<Vec<SyncLogEntry>> {
        self.read_store().recent_sync_log(target, limit).await
    }

    async fn reference(&self) -> StoreResult<Arc<ReferenceData>> {
        self.read_store().reference().await
    }

    async fn reset_reference(&self) {
        self.primary.reset_reference().await;
        if let Some(shadow) = &self.shadow {
            shadow.reset_reference().await;
        }
    }

    async fn seed_reference(
        &self,
        units: &[OrganizationalUnit],
        topics: &[Topic],
    ) -> StoreResult<(u64, u64)> {
        let counts = self.primary.seed_reference(units, topics).await?;
        if let Some(shadow) = self.shadow_for_write() {
            if let Err(err) = shadow.seed_reference(units, topics).await {
                self.record_shadow_failure("seed_reference", &err, std::iter::empty());
            }
        }
        Ok(counts)
    }

    async fn resync_denormalized(&self) -> StoreResult<u64> {
        let touched = self.primary.resync_denormalized().await?;
        if let Some(shadow) = self.shadow_for_write() {
            if let Err(err) = shadow.resync_denormalized().await {
                self.record_shadow_failure("resync_denormalized", &err, std::iter::empty());
            }
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use chrono::{TimeZone, Utc};
    use newsmirror_core::RawRecord;

    fn unit() -> OrganizationalUnit {
        OrganizationalUnit {
            id: 1,
            key: "mec".into(),
            name: "Ministério da Educação".into(),
            unit_type: None,
            parent_key: None,
        }
    }

    fn backends() -> (Arc<MemoryStore>, Arc<MemoryStore>) {
        (
            Arc::new(MemoryStore::with_reference(vec![unit()], vec![])),
            Arc::new(MemoryStore::with_reference(vec![unit()], vec![])),
        )
    }

    fn record(title: &str) -> NewRecord {
        RawRecord {
            org_unit_key: "mec".into(),
            title: title.into(),
            published_at: Utc.with_ymd_and_hms(2025, 4, 2, 10, 0, 0).single().unwrap(),
            url: None,
            body: Some("Texto".into()),
            subtitle: None,
            editorial_lead: None,
            image_url: None,
            video_url: None,
            category: None,
            tags: vec![],
            source_updated_at: None,
            extracted_at: None,
        }
        .into_new_record()
    }

    fn dual(primary: &Arc<MemoryStore>, shadow: &Arc<MemoryStore>) -> StorageAdapter {
        StorageAdapter::new(
            primary.clone(),
            Some(shadow.clone()),
            StorageMode::DualWrite {
                read_from: Backend::Primary,
            },
        )
        .unwrap()
    }

    #[test]
    fn mode_parsing_rejects_impossible_combinations() {
        assert_eq!(
            StorageMode::parse("dual-write", Some("shadow")).unwrap(),
            StorageMode::DualWrite {
                read_from: Backend::Shadow
            }
        );
        assert_eq!(StorageMode::parse("cutover", None).unwrap(), StorageMode::Cutover);
        assert!(StorageMode::parse("primary-only", Some("shadow")).is_err());
        assert!(StorageMode::parse("triple-write", None).is_err());
    }

    #[test]
    fn dual_write_requires_a_shadow() {
        let primary: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let result = StorageAdapter::new(
            primary,
            None,
            StorageMode::DualWrite {
                read_from: Backend::Primary,
            },
        );
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn rollback_to_shadow_reads_sees_successful_shadow_write() {
        let (primary, shadow) = backends();
        let adapter = dual(&primary, &shadow);
        let r = record("R");
        adapter.insert(&[r.clone()], false).await.unwrap();

        adapter
            .set_mode(StorageMode::DualWrite {
                read_from: Backend::Shadow,
            })
            .unwrap();
        let read = adapter.get_by_unique_id(&r.unique_id).await.unwrap();
        assert_eq!(read.map(|rec| rec.title), Some("R".to_string()));
        assert_eq!(adapter.shadow_failures(), 0);
    }

    #[tokio::test]
    async fn failed_shadow_write_leaves_record_absent_from_shadow_reads() {
        let (primary, shadow) = backends();
        let adapter = dual(&primary, &shadow);
        let r = record("R");

        shadow.set_unavailable(true);
        let summary = adapter.insert(&[r.clone()], false).await.unwrap();
        assert_eq!(summary.written, 1);
        shadow.set_unavailable(false);

        assert!(adapter.get_by_unique_id(&r.unique_id).await.unwrap().is_some());
        adapter
            .set_mode(StorageMode::DualWrite {
                read_from: Backend::Shadow,
            })
            .unwrap();
        assert!(adapter.get_by_unique_id(&r.unique_id).await.unwrap().is_none());
        assert_eq!(adapter.shadow_failures(), 1);
        assert_eq!(adapter.pending_shadow_repairs(), vec![r.unique_id.clone()]);

        assert_eq!(adapter.repair_shadow().await.unwrap(), 1);
        assert!(adapter.get_by_unique_id(&r.unique_id).await.unwrap().is_some());
        assert!(adapter.pending_shadow_repairs().is_empty());
    }

    #[tokio::test]
    async fn repair_keeps_primary_timestamps() {
        let (primary, shadow) = backends();
        let adapter = dual(&primary, &shadow);
        let r = record("R");
        shadow.set_unavailable(true);
        adapter.insert(&[r.clone()], false).await.unwrap();
        shadow.set_unavailable(false);

        assert_eq!(adapter.repair_shadow().await.unwrap(), 1);
        let on_primary = primary.get_by_unique_id(&r.unique_id).await.unwrap().unwrap();
        let on_shadow = shadow.get_by_unique_id(&r.unique_id).await.unwrap().unwrap();
        assert_eq!(on_shadow.updated_at, on_primary.updated_at);
        assert_eq!(on_shadow.created_at, on_primary.created_at);
        assert_eq!(on_shadow.last_synced_to_index, None);
    }

    #[tokio::test]
    async fn ids_requeued_during_a_repair_pass_stay_queued() {
        let (primary, shadow) = backends();
        let adapter = dual(&primary, &shadow);
        let (first, second) = (record("A"), record("B"));
        shadow.set_unavailable(true);
        adapter.insert(&[first.clone(), second.clone()], false).await.unwrap();
        shadow.set_unavailable(false);

        let snapshot = adapter.queued_repairs();
        // A write to `first` fails on the shadow after the pass read the primary.
        let err = StoreError::unavailable("shadow timed out");
        adapter.record_shadow_failure("update", &err, [&first.unique_id]);

        assert_eq!(adapter.settle_repairs(&snapshot), 1);
        assert_eq!(adapter.pending_shadow_repairs(), vec![first.unique_id.clone()]);
        assert_eq!(adapter.shadow_failures(), 2);
    }

    #[tokio::test]
    async fn memory_shadow_with_primary_reference_takes_dual_writes() {
        let primary = Arc::new(MemoryStore::with_reference(vec![unit()], vec![]));
        let shadow = Arc::new(MemoryStore::with_reference_of(primary.as_ref()).await.unwrap());
        let adapter = dual(&primary, &shadow);

        adapter.insert(&[record("R")], false).await.unwrap();
        assert_eq!(adapter.shadow_failures(), 0);
        assert_eq!(shadow.len(), 1);
        let stored = shadow.get_by_unique_id(&record("R").unique_id).await.unwrap().unwrap();
        assert_eq!(stored.org_unit.name, "Ministério da Educação");
    }

    #[tokio::test]
    async fn mark_synced_stamps_each_backend_with_its_own_version() {
        let (primary, shadow) = backends();
        let adapter = dual(&primary, &shadow);
        adapter.insert(&[record("A"), record("B")], false).await.unwrap();

        let pending = adapter.records_pending_sync(SyncTarget::Mirror, 10).await.unwrap();
        let versions: Vec<_> = pending.iter().map(Record::synced_version).collect();
        assert_eq!(adapter.mark_synced(SyncTarget::Mirror, &versions).await.unwrap(), 2);
        assert_eq!(primary.count_pending(SyncTarget::Mirror).await.unwrap(), 0);
        assert_eq!(shadow.count_pending(SyncTarget::Mirror).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn primary_failure_fails_the_logical_write() {
        let (primary, shadow) = backends();
        let adapter = dual(&primary, &shadow);
        primary.set_unavailable(true);
        let err = adapter.insert(&[record("R")], false).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(shadow.is_empty());
    }

    #[tokio::test]
    async fn primary_only_never_touches_shadow() {
        let (primary, shadow) = backends();
        let adapter =
            StorageAdapter::new(primary.clone(), Some(shadow.clone()), StorageMode::PrimaryOnly)
                .unwrap();
        adapter.insert(&[record("R")], false).await.unwrap();
        assert_eq!(primary.len(), 1);
        assert!(shadow.is_empty());
        assert!(adapter
            .set_mode(StorageMode::DualWrite {
                read_from: Backend::Shadow
            })
            .is_ok());
    }

    #[tokio::test]
    async fn field_map_updates_are_routed_to_both_backends() {
        let (primary, shadow) = backends();
        let adapter = dual(&primary, &shadow);
        let r = record("R");
        adapter.insert(&[r.clone()], false).await.unwrap();

        let fields = serde_json::json!({ "summary": "Resumo" });
        assert!(adapter
            .update_fields(&r.unique_id, fields.as_object().unwrap())
            .await
            .unwrap());
        let on_shadow = shadow.get_by_unique_id(&r.unique_id).await.unwrap().unwrap();
        assert_eq!(on_shadow.summary.as_deref(), Some("Resumo"));

        let unknown = serde_json::json!({ "no_such_field": 1 });
        assert!(adapter
            .update_fields(&r.unique_id, unknown.as_object().unwrap())
            .await
            .is_err());
    }
}
