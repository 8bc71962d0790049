//! Core domain model, error taxonomy and sync bookkeeping types for newsmirror.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

mod patch;
mod reference;

pub use patch::{FieldAssignment, RecordPatch};
pub use reference::{validate_reference, ReferenceData};

pub const CRATE_NAME: &str = "newsmirror-core";

/// Upper bound accepted by listing operations.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Failure taxonomy shared by every backend. Lookups signal "not found" with `Option`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Only connectivity-class failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationalUnit {
    pub id: i32,
    pub key: String,
    pub name: String,
    pub unit_type: Option<String>,
    pub parent_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: i32,
    pub code: String,
    pub label: String,
    pub level: i16,
    pub parent_code: Option<String>,
}

/// Denormalized copy of the owning unit carried on every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRef {
    pub id: i32,
    pub key: String,
    pub name: String,
}

impl From<&OrganizationalUnit> for UnitRef {
    fn from(unit: &OrganizationalUnit) -> Self {
        Self {
            id: unit.id,
            key: unit.key.clone(),
            name: unit.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRef {
    pub id: i32,
    pub code: String,
    pub label: String,
}

impl From<&Topic> for TopicRef {
    fn from(topic: &Topic) -> Self {
        Self {
            id: topic.id,
            code: topic.code.clone(),
            label: topic.label.clone(),
        }
    }
}

/// Topic codes as handed over by producers and enrichment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCodes {
    pub l1: Option<String>,
    pub l2: Option<String>,
    pub l3: Option<String>,
    pub most_specific: Option<String>,
}

/// Resolved topic classification of a persisted record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicAssignment {
    pub l1: Option<TopicRef>,
    pub l2: Option<TopicRef>,
    pub l3: Option<TopicRef>,
    pub most_specific: Option<TopicRef>,
}

/// Raw scraper output before it reaches the write path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub org_unit_key: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub url: Option<String>,
    pub body: Option<String>,
    pub subtitle: Option<String>,
    pub editorial_lead: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub extracted_at: Option<DateTime<Utc>>,
}

impl RawRecord {
    pub fn unique_id(&self) -> String {
        derive_unique_id(&self.org_unit_key, self.published_at, &self.title)
    }

    pub fn into_new_record(self) -> NewRecord {
        NewRecord {
            unique_id: self.unique_id(),
            org_unit_key: self.org_unit_key,
            topics: TopicCodes::default(),
            title: self.title,
            url: self.url,
            image_url: self.image_url,
            video_url: self.video_url,
            category: self.category,
            tags: self.tags,
            body: self.body,
            editorial_lead: self.editorial_lead,
            subtitle: self.subtitle,
            summary: None,
            published_at: self.published_at,
            source_updated_at: self.source_updated_at,
            extracted_at: self.extracted_at,
        }
    }
}

/// Content-derived natural key: 32 hex chars of SHA-256 over unit, timestamp and title.
pub fn derive_unique_id(org_unit_key: &str, published_at: DateTime<Utc>, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{org_unit_key}_{}_{title}", published_at.to_rfc3339()).as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Write-path payload; the store resolves unit and topic references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub unique_id: String,
    pub org_unit_key: String,
    #[serde(default)]
    pub topics: TopicCodes,
    pub title: String,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub body: Option<String>,
    pub editorial_lead: Option<String>,
    pub subtitle: Option<String>,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub extracted_at: Option<DateTime<Utc>>,
}

impl NewRecord {
    pub fn validate(&self) -> StoreResult<()> {
        if self.unique_id.trim().is_empty() {
            return Err(StoreError::invalid("record without unique_id"));
        }
        if self.title.trim().is_empty() {
            return Err(StoreError::invalid(format!(
                "record {} has an empty title",
                self.unique_id
            )));
        }
        if self.org_unit_key.trim().is_empty() {
            return Err(StoreError::invalid(format!(
                "record {} has no organizational unit",
                self.unique_id
            )));
        }
        Ok(())
    }
}

/// Collapse repeated `unique_id`s inside one batch, keeping the first occurrence.
pub fn dedup_by_unique_id(records: &[NewRecord]) -> Vec<&NewRecord> {
    let mut seen = std::collections::HashSet::new();
    records
        .iter()
        .filter(|r| seen.insert(r.unique_id.as_str()))
        .collect()
}

/// Canonical persisted news item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub unique_id: String,
    pub org_unit: UnitRef,
    pub topics: TopicAssignment,
    pub title: String,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub body: Option<String>,
    pub editorial_lead: Option<String>,
    pub subtitle: Option<String>,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_to_index: Option<DateTime<Utc>>,
    pub last_synced_to_mirror: Option<DateTime<Utc>>,
}

impl Record {
    pub fn last_synced(&self, target: SyncTarget) -> Option<DateTime<Utc>> {
        match target {
            SyncTarget::SearchIndex => self.last_synced_to_index,
            SyncTarget::Mirror => self.last_synced_to_mirror,
        }
    }

    /// Pending means never synced, or changed after the last confirmed sync.
    pub fn is_pending(&self, target: SyncTarget) -> bool {
        match self.last_synced(target) {
            None => true,
            Some(synced) => synced < self.updated_at,
        }
    }

    pub fn pending_cursor(&self) -> PendingCursor {
        PendingCursor {
            published_at: self.published_at,
            unique_id: self.unique_id.clone(),
        }
    }

    /// The version of this row a downstream received, for [`SyncedVersion`] stamping.
    pub fn synced_version(&self) -> SyncedVersion {
        SyncedVersion {
            unique_id: self.unique_id.clone(),
            updated_at: self.updated_at,
        }
    }

    /// Write-path form of a stored row, used to copy it into another backend.
    pub fn to_new_record(&self) -> NewRecord {
        let code = |t: &Option<TopicRef>| t.as_ref().map(|t| t.code.clone());
        NewRecord {
            unique_id: self.unique_id.clone(),
            org_unit_key: self.org_unit.key.clone(),
            topics: TopicCodes {
                l1: code(&self.topics.l1),
                l2: code(&self.topics.l2),
                l3: code(&self.topics.l3),
                most_specific: code(&self.topics.most_specific),
            },
            title: self.title.clone(),
            url: self.url.clone(),
            image_url: self.image_url.clone(),
            video_url: self.video_url.clone(),
            category: self.category.clone(),
            tags: self.tags.clone(),
            body: self.body.clone(),
            editorial_lead: self.editorial_lead.clone(),
            subtitle: self.subtitle.clone(),
            summary: self.summary.clone(),
            published_at: self.published_at,
            source_updated_at: self.source_updated_at,
            extracted_at: self.extracted_at,
        }
    }
}

/// Keyset position inside the pending feed, ordered by `(published_at, unique_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingCursor {
    pub published_at: DateTime<Utc>,
    pub unique_id: String,
}

/// A row as it was read for delivery. Marking stamps `last_synced_*` with `updated_at`
/// and only while the row still carries that `updated_at`; a row rewritten since the
/// read keeps its newer stamp and stays pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedVersion {
    pub unique_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTarget {
    SearchIndex,
    Mirror,
}

impl SyncTarget {
    pub const ALL: [SyncTarget; 2] = [SyncTarget::SearchIndex, SyncTarget::Mirror];

    pub fn as_str(self) -> &'static str {
        match self {
            SyncTarget::SearchIndex => "index",
            SyncTarget::Mirror => "mirror",
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTarget {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "index" | "search_index" | "search-index" => Ok(SyncTarget::SearchIndex),
            "mirror" => Ok(SyncTarget::Mirror),
            other => Err(StoreError::invalid(format!("unknown sync target {other:?}"))),
        }
    }
}

/// Watermark of the last confirmed batch for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub target: SyncTarget,
    pub watermark: DateTime<Utc>,
    pub last_unique_id: Option<String>,
    pub records_confirmed: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    Partial,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Completed => "completed",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(BatchStatus::Completed),
            "partial" => Ok(BatchStatus::Partial),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(StoreError::Internal(format!("unknown batch status {other:?}"))),
        }
    }
}

/// One batch attempt against a downstream target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub run_id: Uuid,
    pub target: SyncTarget,
    pub batch_no: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub record_count: i32,
    pub accepted: i32,
    pub rejected: i32,
    pub status: BatchStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertSummary {
    /// Rows inserted or overwritten.
    pub written: u64,
    /// Rows left untouched because their `unique_id` already existed.
    pub skipped: u64,
}

/// Exact-match constraint on an indexed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    UniqueId(String),
    OrgUnitKey(String),
    TopicL1(String),
    TopicL2(String),
    TopicL3(String),
    Category(String),
}

impl Filter {
    /// Parse `column=value`.
    pub fn parse(expr: &str) -> StoreResult<Self> {
        let (column, value) = expr
            .split_once('=')
            .ok_or_else(|| StoreError::invalid(format!("filter {expr:?} is not column=value")))?;
        let value = value.trim().to_string();
        match column.trim() {
            "unique_id" => Ok(Filter::UniqueId(value)),
            "org_unit_key" | "org_unit" => Ok(Filter::OrgUnitKey(value)),
            "topic_l1" => Ok(Filter::TopicL1(value)),
            "topic_l2" => Ok(Filter::TopicL2(value)),
            "topic_l3" => Ok(Filter::TopicL3(value)),
            "category" => Ok(Filter::Category(value)),
            other => Err(StoreError::invalid(format!(
                "cannot filter on {other:?}: not an indexed column"
            ))),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        fn topic_code(t: &Option<TopicRef>) -> Option<&str> {
            t.as_ref().map(|t| t.code.as_str())
        }
        match self {
            Filter::UniqueId(v) => record.unique_id == *v,
            Filter::OrgUnitKey(v) => record.org_unit.key == *v,
            Filter::TopicL1(v) => topic_code(&record.topics.l1) == Some(v.as_str()),
            Filter::TopicL2(v) => topic_code(&record.topics.l2) == Some(v.as_str()),
            Filter::TopicL3(v) => topic_code(&record.topics.l3) == Some(v.as_str()),
            Filter::Category(v) => record.category.as_deref() == Some(v.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    PublishedAtDesc,
    PublishedAtAsc,
    UpdatedAtDesc,
}

impl FromStr for OrderBy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "published_at desc" | "published_at_desc" => Ok(OrderBy::PublishedAtDesc),
            "published_at asc" | "published_at_asc" | "published_at" => Ok(OrderBy::PublishedAtAsc),
            "updated_at desc" | "updated_at_desc" => Ok(OrderBy::UpdatedAtDesc),
            other => Err(StoreError::invalid(format!("unsupported ordering {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub filters: Vec<Filter>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub order_by: OrderBy,
}

impl ListQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Listing without a bounded limit is refused rather than clamped.
    pub fn checked_limit(&self) -> StoreResult<usize> {
        match self.limit {
            None => Err(StoreError::invalid("list requires an explicit limit")),
            Some(0) => Err(StoreError::invalid("list limit must be positive")),
            Some(n) if n > MAX_LIST_LIMIT => Err(StoreError::invalid(format!(
                "list limit {n} exceeds the cap of {MAX_LIST_LIMIT}"
            ))),
            Some(n) => Ok(n),
        }
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` and `YYYY-MM-DD`; naive values are taken as UTC.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

/// ISO 8601 week id in `YYYYWW` form.
pub fn iso_week_id(at: DateTime<Utc>) -> u32 {
    let week = at.iso_week();
    (week.year() * 100 + week.week() as i32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn unique_id_is_stable_and_content_derived() {
        let a = derive_unique_id("mec", ts(2025, 1, 15), "Nova política");
        let b = derive_unique_id("mec", ts(2025, 1, 15), "Nova política");
        let c = derive_unique_id("mec", ts(2025, 1, 15), "Outra política");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn timestamp_parsing_accepts_legacy_formats() {
        assert_eq!(parse_timestamp("2025-01-15T12:00:00Z"), Some(ts(2025, 1, 15)));
        assert_eq!(parse_timestamp("2025-01-15 12:00:00"), Some(ts(2025, 1, 15)));
        assert_eq!(
            parse_timestamp("2025-01-15"),
            Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).single()
        );
        assert_eq!(parse_timestamp("15/01/2025"), None);
        assert_eq!(parse_timestamp("   "), None);
    }

    #[test]
    fn iso_week_matches_calendar_edges() {
        assert_eq!(iso_week_id(ts(2024, 1, 1)), 202401);
        assert_eq!(iso_week_id(ts(2025, 1, 15)), 202503);
        // 2021-01-03 still belongs to ISO week 53 of 2020.
        assert_eq!(iso_week_id(ts(2021, 1, 3)), 202053);
    }

    #[test]
    fn filters_only_accept_indexed_columns() {
        assert_eq!(
            Filter::parse("org_unit_key=mec").unwrap(),
            Filter::OrgUnitKey("mec".into())
        );
        assert!(matches!(
            Filter::parse("body=anything"),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(Filter::parse("mec"), Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn list_limit_must_be_bounded() {
        assert!(ListQuery::default().checked_limit().is_err());
        assert!(ListQuery::new(MAX_LIST_LIMIT + 1).checked_limit().is_err());
        assert_eq!(ListQuery::new(50).checked_limit().unwrap(), 50);
    }

    #[test]
    fn batch_dedup_keeps_first_occurrence() {
        let raw = RawRecord {
            org_unit_key: "mec".into(),
            title: "Same".into(),
            published_at: ts(2025, 2, 1),
            url: None,
            body: Some("first".into()),
            subtitle: None,
            editorial_lead: None,
            image_url: None,
            video_url: None,
            category: None,
            tags: vec![],
            source_updated_at: None,
            extracted_at: None,
        };
        let first = raw.clone().into_new_record();
        let mut second = raw.into_new_record();
        second.body = Some("second".into());
        let batch = vec![first, second];
        let deduped = dedup_by_unique_id(&batch);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].body.as_deref(), Some("first"));
    }

    #[test]
    fn sync_target_round_trips_through_names() {
        for target in SyncTarget::ALL {
            assert_eq!(target.as_str().parse::<SyncTarget>().unwrap(), target);
        }
        assert!("huggingface".parse::<SyncTarget>().is_err());
    }
}
