//! In-process backend with the same contract as the Postgres store.
//!
//! Used as the shadow backend in local runs and as the store double in job
//! tests; `set_unavailable` makes every call fail with `StoreError::Unavailable`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsmirror_core::{
    Filter, InsertSummary, ListQuery, NewRecord, OrderBy, OrganizationalUnit, PendingCursor,
    Record, RecordPatch, ReferenceData, StoreError, StoreResult, SyncCursor, SyncLogEntry,
    SyncTarget, SyncedVersion, Topic,
};

use crate::cache::{ReferenceCache, ReferenceSource};
use crate::{
    prepare_batch, resolve_patch, MaintenanceControl, RecordStore, ResolvedAssignment, TopicSlot,
};

#[derive(Debug, Default)]
struct MemoryState {
    units: BTreeMap<String, OrganizationalUnit>,
    topics: BTreeMap<String, Topic>,
    next_reference_id: i32,
    records: BTreeMap<String, Record>,
    cursors: HashMap<SyncTarget, SyncCursor>,
    log: Vec<SyncLogEntry>,
    maintenance_relaxed: bool,
    maintenance_cycles: u32,
    rejected_ids: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    cache: ReferenceCache,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with reference rows; ids are kept as given.
    pub fn with_reference(units: Vec<OrganizationalUnit>, topics: Vec<Topic>) -> Self {
        let store = Self::default();
        {
            let mut state = store.lock();
            state.next_reference_id = units
                .iter()
                .map(|u| u.id)
                .chain(topics.iter().map(|t| t.id))
                .max()
                .unwrap_or(0);
            state.units = units.into_iter().map(|u| (u.key.clone(), u)).collect();
            state.topics = topics.into_iter().map(|t| (t.code.clone(), t)).collect();
        }
        store
    }

    /// Empty store carrying another backend's units and topics, so it accepts the same writes.
    pub async fn with_reference_of(source: &dyn RecordStore) -> StoreResult<Self> {
        let refs = source.reference().await?;
        let units: Vec<OrganizationalUnit> = refs.units().cloned().collect();
        let topics: Vec<Topic> = refs.topics().cloned().collect();
        let store = Self::new();
        if !units.is_empty() || !topics.is_empty() {
            store.seed_reference(&units, &topics).await?;
        }
        Ok(store)
    }

    /// Fault injection: while set, every operation reports the backend unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fault injection: any insert batch carrying `unique_id` fails as invalid, the way
    /// Postgres refuses a whole statement over one bad value.
    pub fn reject_unique_id(&self, unique_id: &str) {
        self.lock().rejected_ids.insert(unique_id.to_string());
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn maintenance_relaxed(&self) -> bool {
        self.lock().maintenance_relaxed
    }

    /// Completed relax/restore cycles.
    pub fn maintenance_cycles(&self) -> u32 {
        self.lock().maintenance_cycles
    }

    /// Rename a unit directly, the way an administrative process would, leaving records stale.
    pub fn rename_unit(&self, key: &str, name: &str) -> bool {
        match self.lock().units.get_mut(key) {
            Some(unit) => {
                unit.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Overwrite a row's `updated_at` without touching its content, the way a writer whose
    /// transaction began before a concurrent read would leave it on commit.
    pub fn set_updated_at(&self, unique_id: &str, at: DateTime<Utc>) -> bool {
        match self.lock().records.get_mut(unique_id) {
            Some(record) => {
                record.updated_at = at;
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panicking test thread must not wedge the store for the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("memory backend marked unavailable"))
        } else {
            Ok(())
        }
    }
}

fn apply_assignment(record: &mut Record, assignment: ResolvedAssignment) {
    match assignment {
        ResolvedAssignment::Text(column, value) => match column {
            "title" => record.title = value.unwrap_or_default(),
            "url" => record.url = value,
            "image_url" => record.image_url = value,
            "video_url" => record.video_url = value,
            "category" => record.category = value,
            "body" => record.body = value,
            "editorial_lead" => record.editorial_lead = value,
            "subtitle" => record.subtitle = value,
            "summary" => record.summary = value,
            _ => {}
        },
        ResolvedAssignment::Tags(tags) => record.tags = tags,
        ResolvedAssignment::Timestamp(column, value) => match column {
            "published_at" => {
                if let Some(at) = value {
                    record.published_at = at;
                }
            }
            "source_updated_at" => record.source_updated_at = value,
            "extracted_at" => record.extracted_at = value,
            _ => {}
        },
        ResolvedAssignment::Unit(unit) => record.org_unit = unit,
        ResolvedAssignment::Topic(slot, topic) => match slot {
            TopicSlot::L1 => record.topics.l1 = topic,
            TopicSlot::L2 => record.topics.l2 = topic,
            TopicSlot::L3 => record.topics.l3 = topic,
            TopicSlot::MostSpecific => record.topics.most_specific = topic,
        },
    }
}

fn materialize(
    refs: &ReferenceData,
    record: &NewRecord,
    unit: newsmirror_core::UnitRef,
    now: DateTime<Utc>,
) -> Record {
    Record {
        unique_id: record.unique_id.clone(),
        org_unit: unit,
        topics: refs.resolve_topics(&record.topics),
        title: record.title.clone(),
        url: record.url.clone(),
        image_url: record.image_url.clone(),
        video_url: record.video_url.clone(),
        category: record.category.clone(),
        tags: record.tags.clone(),
        body: record.body.clone(),
        editorial_lead: record.editorial_lead.clone(),
        subtitle: record.subtitle.clone(),
        summary: record.summary.clone(),
        published_at: record.published_at,
        source_updated_at: record.source_updated_at,
        extracted_at: record.extracted_at,
        created_at: now,
        updated_at: now,
        last_synced_to_index: None,
        last_synced_to_mirror: None,
    }
}

#[async_trait]
impl ReferenceSource for MemoryStore {
    async fn fetch_units(&self) -> StoreResult<Vec<OrganizationalUnit>> {
        self.check_available()?;
        Ok(self.lock().units.values().cloned().collect())
    }

    async fn fetch_topics(&self) -> StoreResult<Vec<Topic>> {
        self.check_available()?;
        Ok(self.lock().topics.values().cloned().collect())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, records: &[NewRecord], allow_update: bool) -> StoreResult<InsertSummary> {
        self.check_available()?;
        let refs = self.reference().await?;
        let rows = prepare_batch(&refs, records)?;

        let now = Utc::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(bad) = records
            .iter()
            .find(|r| state.rejected_ids.contains(&r.unique_id))
        {
            return Err(StoreError::invalid(format!(
                "invalid byte sequence in row {}",
                bad.unique_id
            )));
        }
        let mut summary = InsertSummary::default();
        for (record, unit) in rows {
            let fresh = materialize(&refs, record, unit, now);
            match state.records.get_mut(&record.unique_id) {
                Some(existing) if allow_update => {
                    let created_at = existing.created_at;
                    let index = existing.last_synced_to_index;
                    let mirror = existing.last_synced_to_mirror;
                    *existing = Record {
                        created_at,
                        last_synced_to_index: index,
                        last_synced_to_mirror: mirror,
                        ..fresh
                    };
                    summary.written += 1;
                }
                Some(_) => {}
                None => {
                    state.records.insert(record.unique_id.clone(), fresh);
                    summary.written += 1;
                }
            }
        }
        summary.skipped = (records.len() as u64).saturating_sub(summary.written);
        Ok(summary)
    }

    async fn copy_records(&self, records: &[Record]) -> StoreResult<u64> {
        self.check_available()?;
        if records.is_empty() {
            return Ok(0);
        }
        let refs = self.reference().await?;
        let copies: Vec<NewRecord> = records.iter().map(Record::to_new_record).collect();
        let rows = prepare_batch(&refs, &copies)?;

        let sources: HashMap<&str, &Record> =
            records.iter().map(|r| (r.unique_id.as_str(), r)).collect();

        let mut state = self.lock();
        let mut written = 0u64;
        for (copy, unit) in rows {
            let Some(source) = sources.get(copy.unique_id.as_str()) else {
                continue;
            };
            let mut fresh = materialize(&refs, copy, unit, source.updated_at);
            fresh.created_at = source.created_at;
            if let Some(existing) = state.records.get(&copy.unique_id) {
                fresh.last_synced_to_index = existing.last_synced_to_index;
                fresh.last_synced_to_mirror = existing.last_synced_to_mirror;
            }
            state.records.insert(copy.unique_id.clone(), fresh);
            written += 1;
        }
        Ok(written)
    }

    async fn update(&self, unique_id: &str, patch: &RecordPatch) -> StoreResult<bool> {
        self.check_available()?;
        let refs = self.reference().await?;
        let assignments = resolve_patch(&refs, patch)?;
        let mut state = self.lock();
        let Some(record) = state.records.get_mut(unique_id) else {
            return Ok(false);
        };
        for assignment in assignments {
            apply_assignment(record, assignment);
        }
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn get_by_unique_id(&self, unique_id: &str) -> StoreResult<Option<Record>> {
        self.check_available()?;
        Ok(self.lock().records.get(unique_id).cloned())
    }

    async fn list(&self, query: &ListQuery) -> StoreResult<Vec<Record>> {
        self.check_available()?;
        let limit = query.checked_limit()?;
        let state = self.lock();
        let mut rows: Vec<&Record> = state
            .records
            .values()
            .filter(|r| query.filters.iter().all(|f| f.matches(r)))
            .collect();
        match query.order_by {
            OrderBy::PublishedAtDesc => rows.sort_by(|a, b| {
                (b.published_at, &b.unique_id).cmp(&(a.published_at, &a.unique_id))
            }),
            OrderBy::PublishedAtAsc => rows.sort_by(|a, b| {
                (a.published_at, &a.unique_id).cmp(&(b.published_at, &b.unique_id))
            }),
            OrderBy::UpdatedAtDesc => rows.sort_by(|a, b| {
                (b.updated_at, &b.unique_id).cmp(&(a.updated_at, &a.unique_id))
            }),
        }
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, filters: &[Filter]) -> StoreResult<u64> {
        self.check_available()?;
        let state = self.lock();
        Ok(state
            .records
            .values()
            .filter(|r| filters.iter().all(|f| f.matches(r)))
            .count() as u64)
    }

    async fn pending_sync(
        &self,
        target: SyncTarget,
        after: Option<&PendingCursor>,
        limit: usize,
    ) -> StoreResult<Vec<Record>> {
        self.check_available()?;
        let state = self.lock();
        let mut rows: Vec<&Record> = state
            .records
            .values()
            .filter(|r| r.is_pending(target))
            .filter(|r| after.map_or(true, |cursor| r.pending_cursor() > *cursor))
            .collect();
        rows.sort_by(|a, b| (a.published_at, &a.unique_id).cmp(&(b.published_at, &b.unique_id)));
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    async fn count_pending(&self, target: SyncTarget) -> StoreResult<u64> {
        self.check_available()?;
        let state = self.lock();
        Ok(state.records.values().filter(|r| r.is_pending(target)).count() as u64)
    }

    async fn mark_synced(&self, target: SyncTarget, versions: &[SyncedVersion]) -> StoreResult<u64> {
        self.check_available()?;
        let mut state = self.lock();
        let mut stamped = 0u64;
        let mut watermark: Option<DateTime<Utc>> = None;
        let mut last_unique_id = None;
        for version in versions {
            let Some(record) = state.records.get_mut(&version.unique_id) else {
                continue;
            };
            if record.updated_at != version.updated_at {
                continue;
            }
            match target {
                SyncTarget::SearchIndex => record.last_synced_to_index = Some(version.updated_at),
                SyncTarget::Mirror => record.last_synced_to_mirror = Some(version.updated_at),
            }
            stamped += 1;
            watermark = watermark.max(Some(version.updated_at));
            last_unique_id = Some(version.unique_id.clone());
        }
        let Some(watermark) = watermark else {
            return Ok(0);
        };
        let now = Utc::now();
        let cursor = state.cursors.entry(target).or_insert(SyncCursor {
            target,
            watermark,
            last_unique_id: None,
            records_confirmed: 0,
            updated_at: now,
        });
        cursor.watermark = cursor.watermark.max(watermark);
        cursor.last_unique_id = last_unique_id;
        cursor.records_confirmed += stamped as i64;
        cursor.updated_at = now;
        Ok(stamped)
    }

    async fn sync_cursor(&self, target: SyncTarget) -> StoreResult<Option<SyncCursor>> {
        self.check_available()?;
        Ok(self.lock().cursors.get(&target).cloned())
    }

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> StoreResult<()> {
        self.check_available()?;
        self.lock().log.push(entry.clone());
        Ok(())
    }

    async fn recent_sync_log(
        &self,
        target: Option<SyncTarget>,
        limit: usize,
    ) -> StoreResult<Vec<SyncLogEntry>> {
        self.check_available()?;
        let state = self.lock();
        Ok(state
            .log
            .iter()
            .rev()
            .filter(|e| target.map_or(true, |t| e.target == t))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reference(&self) -> StoreResult<Arc<ReferenceData>> {
        self.cache.snapshot(self).await
    }

    async fn reset_reference(&self) {
        self.cache.reset().await;
    }

    async fn seed_reference(
        &self,
        units: &[OrganizationalUnit],
        topics: &[Topic],
    ) -> StoreResult<(u64, u64)> {
        self.check_available()?;
        newsmirror_core::validate_reference(units, topics)?;
        {
            let mut state = self.lock();
            for unit in units {
                let id = match state.units.get(&unit.key) {
                    Some(existing) => existing.id,
                    None => {
                        state.next_reference_id += 1;
                        state.next_reference_id
                    }
                };
                state
                    .units
                    .insert(unit.key.clone(), OrganizationalUnit { id, ..unit.clone() });
            }
            for topic in topics {
                let id = match state.topics.get(&topic.code) {
                    Some(existing) => existing.id,
                    None => {
                        state.next_reference_id += 1;
                        state.next_reference_id
                    }
                };
                state
                    .topics
                    .insert(topic.code.clone(), Topic { id, ..topic.clone() });
            }
        }
        self.cache.reset().await;
        Ok((units.len() as u64, topics.len() as u64))
    }

    async fn resync_denormalized(&self) -> StoreResult<u64> {
        self.check_available()?;
        self.cache.reset().await;
        let now = Utc::now();
        let mut state = self.lock();
        let units_by_id: HashMap<i32, (String, String)> = state
            .units
            .values()
            .map(|u| (u.id, (u.key.clone(), u.name.clone())))
            .collect();
        let mut touched = 0u64;
        for record in state.records.values_mut() {
            if let Some((key, name)) = units_by_id.get(&record.org_unit.id) {
                if record.org_unit.key != *key || record.org_unit.name != *name {
                    record.org_unit.key = key.clone();
                    record.org_unit.name = name.clone();
                    record.updated_at = now;
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }
}

#[async_trait]
impl MaintenanceControl for MemoryStore {
    async fn relax_maintenance(&self) -> StoreResult<()> {
        self.check_available()?;
        self.lock().maintenance_relaxed = true;
        Ok(())
    }

    async fn restore_maintenance(&self) -> StoreResult<()> {
        self.check_available()?;
        {
            let mut state = self.lock();
            state.maintenance_relaxed = false;
            state.maintenance_cycles += 1;
        }
        self.resync_denormalized().await?;
        Ok(())
    }
}
