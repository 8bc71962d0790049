//! PostgreSQL system of record built on a bounded sqlx pool.
//!
//! Every operation acquires its connection (and transaction, where one is
//! opened) from the pool for its own scope; sqlx returns connections on drop and
//! rolls back uncommitted transactions on drop, so early returns never leak either.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsmirror_core::{
    Filter, InsertSummary, ListQuery, NewRecord, OrderBy, OrganizationalUnit, PendingCursor,
    Record, RecordPatch, ReferenceData, StoreError, StoreResult, SyncCursor, SyncLogEntry,
    SyncTarget, SyncedVersion, Topic, TopicAssignment, UnitRef,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{FromRow, Postgres, QueryBuilder};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{ReferenceCache, ReferenceSource};
use crate::retry::classify_sqlx_error;
use crate::{
    prepare_batch, resolve_patch, MaintenanceControl, RecordStore, ResolvedAssignment,
};

/// Rows per multi-row INSERT; 21 binds each keeps a chunk well below the 65535 parameter cap.
const INSERT_CHUNK_ROWS: usize = 2000;

const RECORD_COLUMNS: &str = "unique_id, org_unit_id, org_unit_key, org_unit_name, \
    topic_l1_id, topic_l2_id, topic_l3_id, most_specific_topic_id, title, url, image_url, \
    video_url, category, tags, body, editorial_lead, subtitle, summary, published_at, \
    source_updated_at, extracted_at, created_at, updated_at, last_synced_to_index, \
    last_synced_to_mirror";

/// Indexes dropped for a bulk load and rebuilt without blocking readers afterwards.
/// The `unique_id` uniqueness constraint must never appear here.
const MAINTENANCE_INDEXES: &[(&str, &str)] = &[
    (
        "idx_record_published_at",
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_record_published_at ON record (published_at DESC)",
    ),
    (
        "idx_record_unit_published",
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_record_unit_published ON record (org_unit_key, published_at DESC)",
    ),
    (
        "idx_record_topic_l1",
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_record_topic_l1 ON record (topic_l1_id)",
    ),
    (
        "idx_record_topic_l2",
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_record_topic_l2 ON record (topic_l2_id)",
    ),
    (
        "idx_record_topic_l3",
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_record_topic_l3 ON record (topic_l3_id)",
    ),
    (
        "idx_record_category",
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_record_category ON record (category)",
    ),
    (
        "idx_record_index_pending",
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_record_index_pending ON record (published_at, unique_id) \
         WHERE last_synced_to_index IS NULL OR last_synced_to_index < updated_at",
    ),
    (
        "idx_record_mirror_pending",
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_record_mirror_pending ON record (published_at, unique_id) \
         WHERE last_synced_to_mirror IS NULL OR last_synced_to_mirror < updated_at",
    ),
    (
        "idx_record_fts",
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_record_fts ON record \
         USING GIN (to_tsvector('portuguese', title || ' ' || COALESCE(LEFT(body, 100000), '')))",
    ),
];

#[derive(Clone)]
pub struct PoolConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

// The URL carries credentials and stays out of logs.
impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct PgStore {
    pool: PgPool,
    cache: ReferenceCache,
}

#[derive(Debug, FromRow)]
struct DbUnit {
    id: i32,
    key: String,
    name: String,
    unit_type: Option<String>,
    parent_key: Option<String>,
}

#[derive(Debug, FromRow)]
struct DbTopic {
    id: i32,
    code: String,
    label: String,
    level: i16,
    parent_code: Option<String>,
}

#[derive(Debug, FromRow)]
struct DbRecord {
    unique_id: String,
    org_unit_id: i32,
    org_unit_key: String,
    org_unit_name: String,
    topic_l1_id: Option<i32>,
    topic_l2_id: Option<i32>,
    topic_l3_id: Option<i32>,
    most_specific_topic_id: Option<i32>,
    title: String,
    url: Option<String>,
    image_url: Option<String>,
    video_url: Option<String>,
    category: Option<String>,
    tags: Vec<String>,
    body: Option<String>,
    editorial_lead: Option<String>,
    subtitle: Option<String>,
    summary: Option<String>,
    published_at: DateTime<Utc>,
    source_updated_at: Option<DateTime<Utc>>,
    extracted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_synced_to_index: Option<DateTime<Utc>>,
    last_synced_to_mirror: Option<DateTime<Utc>>,
}

impl DbRecord {
    fn into_record(self, refs: &ReferenceData) -> Record {
        Record {
            unique_id: self.unique_id,
            org_unit: UnitRef {
                id: self.org_unit_id,
                key: self.org_unit_key,
                name: self.org_unit_name,
            },
            topics: TopicAssignment {
                l1: refs.topic_ref_by_id(self.topic_l1_id),
                l2: refs.topic_ref_by_id(self.topic_l2_id),
                l3: refs.topic_ref_by_id(self.topic_l3_id),
                most_specific: refs.topic_ref_by_id(self.most_specific_topic_id),
            },
            title: self.title,
            url: self.url,
            image_url: self.image_url,
            video_url: self.video_url,
            category: self.category,
            tags: self.tags,
            body: self.body,
            editorial_lead: self.editorial_lead,
            subtitle: self.subtitle,
            summary: self.summary,
            published_at: self.published_at,
            source_updated_at: self.source_updated_at,
            extracted_at: self.extracted_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_synced_to_index: self.last_synced_to_index,
            last_synced_to_mirror: self.last_synced_to_mirror,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbCursor {
    target: String,
    watermark: DateTime<Utc>,
    last_unique_id: Option<String>,
    records_confirmed: i64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct DbSyncLog {
    run_id: Uuid,
    target: String,
    batch_no: i32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    record_count: i32,
    accepted: i32,
    rejected: i32,
    status: String,
    error: Option<String>,
}

impl TryFrom<DbSyncLog> for SyncLogEntry {
    type Error = StoreError;

    fn try_from(row: DbSyncLog) -> Result<Self, Self::Error> {
        Ok(SyncLogEntry {
            run_id: row.run_id,
            target: row.target.parse().map_err(internal)?,
            batch_no: row.batch_no,
            started_at: row.started_at,
            finished_at: row.finished_at,
            record_count: row.record_count,
            accepted: row.accepted,
            rejected: row.rejected,
            status: row.status.parse()?,
            error: row.error,
        })
    }
}

fn internal(err: StoreError) -> StoreError {
    StoreError::Internal(err.to_string())
}

fn synced_column(target: SyncTarget) -> &'static str {
    match target {
        SyncTarget::SearchIndex => "last_synced_to_index",
        SyncTarget::Mirror => "last_synced_to_mirror",
    }
}

fn pending_predicate(target: SyncTarget) -> String {
    let column = synced_column(target);
    format!("({column} IS NULL OR {column} < updated_at)")
}

impl PgStore {
    pub async fn connect(config: &PoolConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(classify_sqlx_error)?;
        info!(
            min_connections = config.min_connections,
            max_connections = config.max_connections,
            "postgres pool ready"
        );
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            cache: ReferenceCache::new(),
        }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| match err {
                sqlx::migrate::MigrateError::Execute(inner) => classify_sqlx_error(inner),
                other => StoreError::Internal(other.to_string()),
            })
    }

    async fn drop_invalid_indexes(&self) -> StoreResult<()> {
        let names: Vec<String> = MAINTENANCE_INDEXES
            .iter()
            .map(|(name, _)| name.to_string())
            .collect();
        let invalid: Vec<String> = sqlx::query_scalar(
            "SELECT c.relname::text FROM pg_index i JOIN pg_class c ON c.oid = i.indexrelid \
             WHERE NOT i.indisvalid AND c.relname = ANY($1)",
        )
        .bind(names)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        for name in invalid {
            warn!(index = %name, "dropping invalid index left by an interrupted build");
            sqlx::raw_sql(&format!("DROP INDEX IF EXISTS {name}"))
                .execute(&self.pool)
                .await
                .map_err(classify_sqlx_error)?;
        }
        Ok(())
    }
}

/// How a batch meets rows that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conflict {
    Skip,
    Overwrite,
    /// Overwrite and take `created_at`/`updated_at` from the incoming row.
    Copy,
}

type BatchRow<'a> = (&'a NewRecord, UnitRef, Option<(DateTime<Utc>, DateTime<Utc>)>);

const CONTENT_UPDATE: &str = "org_unit_id = EXCLUDED.org_unit_id, org_unit_key = EXCLUDED.org_unit_key, \
     org_unit_name = EXCLUDED.org_unit_name, topic_l1_id = EXCLUDED.topic_l1_id, \
     topic_l2_id = EXCLUDED.topic_l2_id, topic_l3_id = EXCLUDED.topic_l3_id, \
     most_specific_topic_id = EXCLUDED.most_specific_topic_id, \
     title = EXCLUDED.title, url = EXCLUDED.url, image_url = EXCLUDED.image_url, \
     video_url = EXCLUDED.video_url, category = EXCLUDED.category, \
     tags = EXCLUDED.tags, body = EXCLUDED.body, \
     editorial_lead = EXCLUDED.editorial_lead, subtitle = EXCLUDED.subtitle, \
     summary = EXCLUDED.summary, published_at = EXCLUDED.published_at, \
     source_updated_at = EXCLUDED.source_updated_at, extracted_at = EXCLUDED.extracted_at";

impl PgStore {
    /// Multi-row upsert in chunks, all inside one transaction. Returns rows affected.
    async fn write_rows(
        &self,
        refs: &ReferenceData,
        rows: Vec<BatchRow<'_>>,
        conflict: Conflict,
    ) -> StoreResult<u64> {
        let span = info_span!("pg_insert", records = rows.len(), ?conflict);
        async {
            let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
            let mut written = 0u64;
            for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                    "INSERT INTO record (unique_id, org_unit_id, org_unit_key, org_unit_name, \
                     topic_l1_id, topic_l2_id, topic_l3_id, most_specific_topic_id, title, url, \
                     image_url, video_url, category, tags, body, editorial_lead, subtitle, summary, \
                     published_at, source_updated_at, extracted_at",
                );
                if conflict == Conflict::Copy {
                    builder.push(", created_at, updated_at");
                }
                builder.push(") ");
                builder.push_values(chunk, |mut b, (record, unit, stamps)| {
                    let topics = refs.resolve_topics(&record.topics);
                    b.push_bind(record.unique_id.clone())
                        .push_bind(unit.id)
                        .push_bind(unit.key.clone())
                        .push_bind(unit.name.clone())
                        .push_bind(topics.l1.map(|t| t.id))
                        .push_bind(topics.l2.map(|t| t.id))
                        .push_bind(topics.l3.map(|t| t.id))
                        .push_bind(topics.most_specific.map(|t| t.id))
                        .push_bind(record.title.clone())
                        .push_bind(record.url.clone())
                        .push_bind(record.image_url.clone())
                        .push_bind(record.video_url.clone())
                        .push_bind(record.category.clone())
                        .push_bind(record.tags.clone())
                        .push_bind(record.body.clone())
                        .push_bind(record.editorial_lead.clone())
                        .push_bind(record.subtitle.clone())
                        .push_bind(record.summary.clone())
                        .push_bind(record.published_at)
                        .push_bind(record.source_updated_at)
                        .push_bind(record.extracted_at);
                    if conflict == Conflict::Copy {
                        let now = Utc::now();
                        let (created_at, updated_at) = stamps.unwrap_or((now, now));
                        b.push_bind(created_at).push_bind(updated_at);
                    }
                });
                match conflict {
                    Conflict::Skip => builder.push(" ON CONFLICT (unique_id) DO NOTHING"),
                    Conflict::Overwrite => builder
                        .push(" ON CONFLICT (unique_id) DO UPDATE SET ")
                        .push(CONTENT_UPDATE)
                        .push(", updated_at = NOW()"),
                    Conflict::Copy => builder
                        .push(" ON CONFLICT (unique_id) DO UPDATE SET ")
                        .push(CONTENT_UPDATE)
                        .push(", created_at = EXCLUDED.created_at, updated_at = EXCLUDED.updated_at"),
                };
                let result = builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(classify_sqlx_error)?;
                written += result.rows_affected();
            }
            tx.commit().await.map_err(classify_sqlx_error)?;
            Ok(written)
        }
        .instrument(span)
        .await
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, refs: &ReferenceData, filters: &[Filter]) {
    builder.push(" WHERE TRUE");
    for filter in filters {
        let (column, value) = match filter {
            Filter::UniqueId(v) => ("unique_id", v),
            Filter::OrgUnitKey(v) => ("org_unit_key", v),
            Filter::Category(v) => ("category", v),
            Filter::TopicL1(code) | Filter::TopicL2(code) | Filter::TopicL3(code) => {
                let column = match filter {
                    Filter::TopicL1(_) => "topic_l1_id",
                    Filter::TopicL2(_) => "topic_l2_id",
                    _ => "topic_l3_id",
                };
                match refs.topic_by_code(code) {
                    Some(topic) => {
                        builder.push(format!(" AND {column} = ")).push_bind(topic.id);
                    }
                    // Unknown code matches nothing.
                    None => {
                        builder.push(" AND FALSE");
                    }
                }
                continue;
            }
        };
        builder.push(format!(" AND {column} = ")).push_bind(value.clone());
    }
}

fn push_assignment(set: &mut Separated<'_, '_, Postgres, &'static str>, assignment: ResolvedAssignment) {
    match assignment {
        ResolvedAssignment::Text(column, value) => {
            set.push(format!("{column} = ")).push_bind_unseparated(value);
        }
        ResolvedAssignment::Tags(tags) => {
            set.push("tags = ").push_bind_unseparated(tags);
        }
        ResolvedAssignment::Timestamp(column, value) => {
            set.push(format!("{column} = ")).push_bind_unseparated(value);
        }
        ResolvedAssignment::Unit(unit) => {
            set.push("org_unit_id = ").push_bind_unseparated(unit.id);
            set.push("org_unit_key = ").push_bind_unseparated(unit.key);
            set.push("org_unit_name = ").push_bind_unseparated(unit.name);
        }
        ResolvedAssignment::Topic(slot, topic) => {
            set.push(format!("{} = ", slot.column()))
                .push_bind_unseparated(topic.map(|t| t.id));
        }
    }
}

#[async_trait]
impl ReferenceSource for PgStore {
    async fn fetch_units(&self) -> StoreResult<Vec<OrganizationalUnit>> {
        let rows: Vec<DbUnit> = sqlx::query_as(
            "SELECT id, key, name, unit_type, parent_key FROM organizational_unit ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(rows
            .into_iter()
            .map(|row| OrganizationalUnit {
                id: row.id,
                key: row.key,
                name: row.name,
                unit_type: row.unit_type,
                parent_key: row.parent_key,
            })
            .collect())
    }

    async fn fetch_topics(&self) -> StoreResult<Vec<Topic>> {
        let rows: Vec<DbTopic> =
            sqlx::query_as("SELECT id, code, label, level, parent_code FROM topic ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(classify_sqlx_error)?;
        Ok(rows
            .into_iter()
            .map(|row| Topic {
                id: row.id,
                code: row.code,
                label: row.label,
                level: row.level,
                parent_code: row.parent_code,
            })
            .collect())
    }
}

#[async_trait]
impl RecordStore for PgStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn insert(&self, records: &[NewRecord], allow_update: bool) -> StoreResult<InsertSummary> {
        let refs = self.reference().await?;
        let rows = prepare_batch(&refs, records)?
            .into_iter()
            .map(|(record, unit)| (record, unit, None))
            .collect();
        let conflict = if allow_update {
            Conflict::Overwrite
        } else {
            Conflict::Skip
        };
        let written = self.write_rows(&refs, rows, conflict).await?;
        let summary = InsertSummary {
            written,
            skipped: (records.len() as u64).saturating_sub(written),
        };
        info!(written = summary.written, skipped = summary.skipped, "insert committed");
        Ok(summary)
    }

    async fn copy_records(&self, records: &[Record]) -> StoreResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let refs = self.reference().await?;
        let copies: Vec<NewRecord> = records.iter().map(Record::to_new_record).collect();
        let stamps: HashMap<&str, (DateTime<Utc>, DateTime<Utc>)> = records
            .iter()
            .map(|r| (r.unique_id.as_str(), (r.created_at, r.updated_at)))
            .collect();
        let rows = prepare_batch(&refs, &copies)?
            .into_iter()
            .map(|(record, unit)| {
                let stamp = stamps.get(record.unique_id.as_str()).copied();
                (record, unit, stamp)
            })
            .collect();
        self.write_rows(&refs, rows, Conflict::Copy).await
    }

    async fn update(&self, unique_id: &str, patch: &RecordPatch) -> StoreResult<bool> {
        let refs = self.reference().await?;
        let assignments = resolve_patch(&refs, patch)?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE record SET ");
        {
            let mut set = builder.separated(", ");
            for assignment in assignments {
                push_assignment(&mut set, assignment);
            }
            set.push("updated_at = NOW()");
        }
        builder
            .push(" WHERE unique_id = ")
            .push_bind(unique_id.to_string());
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_by_unique_id(&self, unique_id: &str) -> StoreResult<Option<Record>> {
        let refs = self.reference().await?;
        let row: Option<DbRecord> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM record WHERE unique_id = $1"
        ))
        .bind(unique_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(row.map(|row| row.into_record(&refs)))
    }

    async fn list(&self, query: &ListQuery) -> StoreResult<Vec<Record>> {
        let limit = query.checked_limit()?;
        let refs = self.reference().await?;

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {RECORD_COLUMNS} FROM record"));
        push_filters(&mut builder, &refs, &query.filters);
        builder.push(match query.order_by {
            OrderBy::PublishedAtDesc => " ORDER BY published_at DESC, unique_id DESC",
            OrderBy::PublishedAtAsc => " ORDER BY published_at ASC, unique_id ASC",
            OrderBy::UpdatedAtDesc => " ORDER BY updated_at DESC, unique_id DESC",
        });
        builder.push(" LIMIT ").push_bind(limit as i64);
        builder.push(" OFFSET ").push_bind(query.offset as i64);

        let rows: Vec<DbRecord> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(rows.into_iter().map(|row| row.into_record(&refs)).collect())
    }

    async fn count(&self, filters: &[Filter]) -> StoreResult<u64> {
        let refs = self.reference().await?;
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM record");
        push_filters(&mut builder, &refs, filters);
        let count: i64 = builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(count as u64)
    }

    async fn pending_sync(
        &self,
        target: SyncTarget,
        after: Option<&PendingCursor>,
        limit: usize,
    ) -> StoreResult<Vec<Record>> {
        let refs = self.reference().await?;
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {RECORD_COLUMNS} FROM record WHERE {}",
            pending_predicate(target)
        ));
        if let Some(cursor) = after {
            builder
                .push(" AND (published_at, unique_id) > (")
                .push_bind(cursor.published_at)
                .push(", ")
                .push_bind(cursor.unique_id.clone())
                .push(")");
        }
        builder
            .push(" ORDER BY published_at ASC, unique_id ASC LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<DbRecord> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(rows.into_iter().map(|row| row.into_record(&refs)).collect())
    }

    async fn count_pending(&self, target: SyncTarget) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM record WHERE {}",
            pending_predicate(target)
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(count as u64)
    }

    async fn mark_synced(&self, target: SyncTarget, versions: &[SyncedVersion]) -> StoreResult<u64> {
        if versions.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = versions.iter().map(|v| v.unique_id.clone()).collect();
        let stamps: Vec<DateTime<Utc>> = versions.iter().map(|v| v.updated_at).collect();

        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
        let stamped: Vec<(String, DateTime<Utc>)> = sqlx::query_as(&format!(
            "UPDATE record r SET {} = v.updated_at \
             FROM UNNEST($1::text[], $2::timestamptz[]) AS v(unique_id, updated_at) \
             WHERE r.unique_id = v.unique_id AND r.updated_at = v.updated_at \
             RETURNING r.unique_id, r.updated_at",
            synced_column(target)
        ))
        .bind(ids)
        .bind(stamps)
        .fetch_all(&mut *tx)
        .await
        .map_err(classify_sqlx_error)?;

        let Some(watermark) = stamped.iter().map(|(_, at)| *at).max() else {
            tx.commit().await.map_err(classify_sqlx_error)?;
            return Ok(0);
        };
        let last_unique_id = versions
            .iter()
            .rev()
            .find(|v| stamped.iter().any(|(id, _)| *id == v.unique_id))
            .map(|v| v.unique_id.clone());

        sqlx::query(
            "INSERT INTO sync_cursor (target, watermark, last_unique_id, records_confirmed, updated_at) \
             VALUES ($1, $2, $3, $4, NOW()) \
             ON CONFLICT (target) DO UPDATE SET \
             watermark = GREATEST(sync_cursor.watermark, EXCLUDED.watermark), \
             last_unique_id = EXCLUDED.last_unique_id, \
             records_confirmed = sync_cursor.records_confirmed + EXCLUDED.records_confirmed, \
             updated_at = NOW()",
        )
        .bind(target.as_str())
        .bind(watermark)
        .bind(last_unique_id)
        .bind(stamped.len() as i64)
        .execute(&mut *tx)
        .await
        .map_err(classify_sqlx_error)?;

        tx.commit().await.map_err(classify_sqlx_error)?;
        Ok(stamped.len() as u64)
    }

    async fn sync_cursor(&self, target: SyncTarget) -> StoreResult<Option<SyncCursor>> {
        let row: Option<DbCursor> = sqlx::query_as(
            "SELECT target, watermark, last_unique_id, records_confirmed, updated_at \
             FROM sync_cursor WHERE target = $1",
        )
        .bind(target.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        row.map(|row| {
            Ok(SyncCursor {
                target: row.target.parse().map_err(internal)?,
                watermark: row.watermark,
                last_unique_id: row.last_unique_id,
                records_confirmed: row.records_confirmed,
                updated_at: row.updated_at,
            })
        })
        .transpose()
    }

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO sync_log (run_id, target, batch_no, started_at, finished_at, \
             record_count, accepted, rejected, status, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(entry.run_id)
        .bind(entry.target.as_str())
        .bind(entry.batch_no)
        .bind(entry.started_at)
        .bind(entry.finished_at)
        .bind(entry.record_count)
        .bind(entry.accepted)
        .bind(entry.rejected)
        .bind(entry.status.as_str())
        .bind(entry.error.as_deref())
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn recent_sync_log(
        &self,
        target: Option<SyncTarget>,
        limit: usize,
    ) -> StoreResult<Vec<SyncLogEntry>> {
        let rows: Vec<DbSyncLog> = sqlx::query_as(
            "SELECT run_id, target, batch_no, started_at, finished_at, record_count, accepted, \
             rejected, status, error FROM sync_log \
             WHERE ($1::text IS NULL OR target = $1) \
             ORDER BY started_at DESC, id DESC LIMIT $2",
        )
        .bind(target.map(SyncTarget::as_str))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        rows.into_iter().map(SyncLogEntry::try_from).collect()
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
        newsmirror_core::validate_reference(units, topics)?;
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
        for unit in units {
            sqlx::query(
                "INSERT INTO organizational_unit (key, name, unit_type, parent_key) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (key) DO UPDATE SET name = EXCLUDED.name, \
                 unit_type = EXCLUDED.unit_type, parent_key = EXCLUDED.parent_key, \
                 updated_at = NOW()",
            )
            .bind(&unit.key)
            .bind(&unit.name)
            .bind(unit.unit_type.as_deref())
            .bind(unit.parent_key.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;
        }
        for topic in topics {
            sqlx::query(
                "INSERT INTO topic (code, label, level, parent_code) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (code) DO UPDATE SET label = EXCLUDED.label, \
                 level = EXCLUDED.level, parent_code = EXCLUDED.parent_code",
            )
            .bind(&topic.code)
            .bind(&topic.label)
            .bind(topic.level)
            .bind(topic.parent_code.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;
        }
        tx.commit().await.map_err(classify_sqlx_error)?;
        self.cache.reset().await;
        Ok((units.len() as u64, topics.len() as u64))
    }

    async fn resync_denormalized(&self) -> StoreResult<u64> {
        self.cache.reset().await;
        let touched = sqlx::query(
            "UPDATE record r SET org_unit_key = u.key, org_unit_name = u.name, updated_at = NOW() \
             FROM organizational_unit u \
             WHERE r.org_unit_id = u.id \
             AND (r.org_unit_key IS DISTINCT FROM u.key OR r.org_unit_name IS DISTINCT FROM u.name)",
        )
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?
        .rows_affected();
        info!(touched, "denormalized unit columns reconciled");
        Ok(touched)
    }
}

#[async_trait]
impl MaintenanceControl for PgStore {
    async fn relax_maintenance(&self) -> StoreResult<()> {
        for (name, _) in MAINTENANCE_INDEXES {
            sqlx::raw_sql(&format!("DROP INDEX IF EXISTS {name}"))
                .execute(&self.pool)
                .await
                .map_err(classify_sqlx_error)?;
        }
        info!(indexes = MAINTENANCE_INDEXES.len(), "maintenance indexes dropped for bulk load");
        Ok(())
    }

    async fn restore_maintenance(&self) -> StoreResult<()> {
        self.drop_invalid_indexes().await?;
        // One statement per call: CONCURRENTLY cannot run inside a transaction block.
        for (name, create) in MAINTENANCE_INDEXES {
            info!(index = name, "rebuilding index concurrently");
            sqlx::raw_sql(create)
                .execute(&self.pool)
                .await
                .map_err(classify_sqlx_error)?;
        }
        self.resync_denormalized().await?;
        Ok(())
    }
}
