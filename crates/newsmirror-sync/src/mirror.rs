use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::{ArrayRef, RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsmirror_core::{Record, StoreError, StoreResult, SyncTarget};
use newsmirror_storage::{retry_with_backoff, RecordStore};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::runner::{BatchOutcome, BatchSink, JobSettings, RunContext, SyncRunner};
use crate::{JobReport, RejectedRecord};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Flattened record as published to the open-data mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRow {
    pub unique_id: String,
    pub org_unit_key: String,
    pub org_unit_name: String,
    pub title: String,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub content: Option<String>,
    pub editorial_lead: Option<String>,
    pub subtitle: Option<String>,
    pub summary: Option<String>,
    pub topic_l1_code: Option<String>,
    pub topic_l1_label: Option<String>,
    pub topic_l2_code: Option<String>,
    pub topic_l2_label: Option<String>,
    pub topic_l3_code: Option<String>,
    pub topic_l3_label: Option<String>,
    pub most_specific_topic_code: Option<String>,
    pub most_specific_topic_label: Option<String>,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub extracted_at: Option<DateTime<Utc>>,
}

impl MirrorRow {
    /// Flatten a record, or describe why it falls below the completeness bar.
    pub fn from_record(record: &Record) -> Result<Self, String> {
        let missing = [
            ("unique_id", record.unique_id.as_str()),
            ("title", record.title.as_str()),
            ("org_unit_key", record.org_unit.key.as_str()),
            ("org_unit_name", record.org_unit.name.as_str()),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(format!("missing required fields: {}", missing.join(", ")));
        }

        let topics = &record.topics;
        let code = |t: &Option<newsmirror_core::TopicRef>| t.as_ref().map(|t| t.code.clone());
        let label = |t: &Option<newsmirror_core::TopicRef>| t.as_ref().map(|t| t.label.clone());
        Ok(Self {
            unique_id: record.unique_id.clone(),
            org_unit_key: record.org_unit.key.clone(),
            org_unit_name: record.org_unit.name.clone(),
            title: record.title.clone(),
            url: record.url.clone(),
            image_url: record.image_url.clone(),
            video_url: record.video_url.clone(),
            category: record.category.clone(),
            tags: record.tags.clone(),
            content: record.body.clone(),
            editorial_lead: record.editorial_lead.clone(),
            subtitle: record.subtitle.clone(),
            summary: record.summary.clone(),
            topic_l1_code: code(&topics.l1),
            topic_l1_label: label(&topics.l1),
            topic_l2_code: code(&topics.l2),
            topic_l2_label: label(&topics.l2),
            topic_l3_code: code(&topics.l3),
            topic_l3_label: label(&topics.l3),
            most_specific_topic_code: code(&topics.most_specific),
            most_specific_topic_label: label(&topics.most_specific),
            published_at: record.published_at,
            updated_at: record.updated_at,
            extracted_at: record.extracted_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub dataset: String,
    pub rows: u64,
    pub sha256: String,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorManifest {
    pub schema_version: u32,
    pub files: Vec<ManifestFile>,
}

impl Default for MirrorManifest {
    fn default() -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            files: Vec::new(),
        }
    }
}

impl MirrorManifest {
    pub fn total_rows(&self, dataset: &str) -> u64 {
        self.files
            .iter()
            .filter(|f| f.dataset == dataset)
            .map(|f| f.rows)
            .sum()
    }
}

/// Files written for one published shard.
#[derive(Debug, Clone)]
pub struct PublishedShard {
    pub full: ManifestFile,
    pub reduced: ManifestFile,
}

/// Destination of mirror shards. A successful return means the shard is durable.
#[async_trait]
pub trait MirrorPublisher: Send + Sync {
    async fn publish(&self, shard_id: &str, rows: &[MirrorRow]) -> StoreResult<PublishedShard>;
}

/// Writes each shard as a full and a reduced parquet file under a local directory,
/// tracked by `manifest.json`.
pub struct ParquetDirectoryMirror {
    root: PathBuf,
    manifest_lock: Mutex<()>,
}

impl ParquetDirectoryMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest_lock: Mutex::new(()),
        }
    }

    pub async fn read_manifest(&self) -> Result<MirrorManifest> {
        let path = self.root.join(MANIFEST_FILE);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(MirrorManifest::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn publish_inner(&self, shard_id: &str, rows: &[MirrorRow]) -> Result<PublishedShard> {
        let created_at = Utc::now();
        let full = self
            .write_shard("full", shard_id, full_batch(rows)?, rows.len(), created_at)
            .await?;
        let reduced = self
            .write_shard("reduced", shard_id, reduced_batch(rows)?, rows.len(), created_at)
            .await?;

        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.read_manifest().await?;
        manifest
            .files
            .retain(|f| f.path != full.path && f.path != reduced.path);
        manifest.files.push(full.clone());
        manifest.files.push(reduced.clone());
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing mirror manifest")?;
        write_atomic(&self.root.join(MANIFEST_FILE), &bytes).await?;
        Ok(PublishedShard { full, reduced })
    }

    async fn write_shard(
        &self,
        dataset: &str,
        shard_id: &str,
        batch: RecordBatch,
        rows: usize,
        created_at: DateTime<Utc>,
    ) -> Result<ManifestFile> {
        let name = format!("shard-{shard_id}.parquet");
        let rel = format!("{dataset}/{name}");
        let bytes = encode_parquet(batch).with_context(|| format!("encoding {rel}"))?;
        write_atomic(&self.root.join(&rel), &bytes).await?;
        debug!(path = %rel, bytes = bytes.len(), "mirror shard written");
        Ok(ManifestFile {
            name,
            path: rel,
            dataset: dataset.to_string(),
            rows: rows as u64,
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
            created_at,
        })
    }
}

#[async_trait]
impl MirrorPublisher for ParquetDirectoryMirror {
    async fn publish(&self, shard_id: &str, rows: &[MirrorRow]) -> StoreResult<PublishedShard> {
        self.publish_inner(shard_id, rows)
            .await
            .map_err(|err| StoreError::Internal(format!("publishing shard {shard_id}: {err:#}")))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Temp file in the target directory, then rename, so readers never see a partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating {}", parent.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("shard");
    let tmp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = async {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .await
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))
    }
    .await;
    if written.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    written
}

fn encode_parquet(batch: RecordBatch) -> Result<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

fn timestamps(values: Vec<Option<i64>>) -> TimestampMicrosecondArray {
    TimestampMicrosecondArray::from(values).with_timezone("UTC")
}

fn strings<'a>(rows: &'a [MirrorRow], f: impl Fn(&'a MirrorRow) -> Option<&'a str>) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
}

pub fn full_schema() -> SchemaRef {
    let text = |name: &str, nullable: bool| ArrowField::new(name, DataType::Utf8, nullable);
    Arc::new(Schema::new(vec![
        text("unique_id", false),
        text("org_unit_key", false),
        text("org_unit_name", false),
        text("title", false),
        text("url", true),
        text("image_url", true),
        text("video_url", true),
        text("category", true),
        ArrowField::new(
            "tags",
            DataType::List(Arc::new(ArrowField::new("item", DataType::Utf8, true))),
            false,
        ),
        text("content", true),
        text("editorial_lead", true),
        text("subtitle", true),
        text("summary", true),
        text("topic_l1_code", true),
        text("topic_l1_label", true),
        text("topic_l2_code", true),
        text("topic_l2_label", true),
        text("topic_l3_code", true),
        text("topic_l3_label", true),
        text("most_specific_topic_code", true),
        text("most_specific_topic_label", true),
        ArrowField::new("published_at", timestamp_type(), false),
        ArrowField::new("updated_at", timestamp_type(), false),
        ArrowField::new("extracted_at", timestamp_type(), true),
    ]))
}

pub fn reduced_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("published_at", timestamp_type(), false),
        ArrowField::new("org_unit_key", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, true),
    ]))
}

fn full_batch(rows: &[MirrorRow]) -> Result<RecordBatch> {
    let mut tags = ListBuilder::new(StringBuilder::new());
    for row in rows {
        for tag in &row.tags {
            tags.values().append_value(tag);
        }
        tags.append(true);
    }

    let columns: Vec<ArrayRef> = vec![
        strings(rows, |r| Some(r.unique_id.as_str())),
        strings(rows, |r| Some(r.org_unit_key.as_str())),
        strings(rows, |r| Some(r.org_unit_name.as_str())),
        strings(rows, |r| Some(r.title.as_str())),
        strings(rows, |r| r.url.as_deref()),
        strings(rows, |r| r.image_url.as_deref()),
        strings(rows, |r| r.video_url.as_deref()),
        strings(rows, |r| r.category.as_deref()),
        Arc::new(tags.finish()),
        strings(rows, |r| r.content.as_deref()),
        strings(rows, |r| r.editorial_lead.as_deref()),
        strings(rows, |r| r.subtitle.as_deref()),
        strings(rows, |r| r.summary.as_deref()),
        strings(rows, |r| r.topic_l1_code.as_deref()),
        strings(rows, |r| r.topic_l1_label.as_deref()),
        strings(rows, |r| r.topic_l2_code.as_deref()),
        strings(rows, |r| r.topic_l2_label.as_deref()),
        strings(rows, |r| r.topic_l3_code.as_deref()),
        strings(rows, |r| r.topic_l3_label.as_deref()),
        strings(rows, |r| r.most_specific_topic_code.as_deref()),
        strings(rows, |r| r.most_specific_topic_label.as_deref()),
        Arc::new(timestamps(
            rows.iter().map(|r| Some(r.published_at.timestamp_micros())).collect(),
        )),
        Arc::new(timestamps(
            rows.iter().map(|r| Some(r.updated_at.timestamp_micros())).collect(),
        )),
        Arc::new(timestamps(
            rows.iter()
                .map(|r| r.extracted_at.map(|t| t.timestamp_micros()))
                .collect(),
        )),
    ];
    RecordBatch::try_new(full_schema(), columns).context("building full mirror batch")
}

fn reduced_batch(rows: &[MirrorRow]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(timestamps(
            rows.iter().map(|r| Some(r.published_at.timestamp_micros())).collect(),
        )),
        strings(rows, |r| Some(r.org_unit_key.as_str())),
        strings(rows, |r| Some(r.title.as_str())),
        strings(rows, |r| r.url.as_deref()),
    ];
    RecordBatch::try_new(reduced_schema(), columns).context("building reduced mirror batch")
}

/// Appends pending records to the mirror, one shard per batch.
pub struct MirrorExportJob {
    runner: SyncRunner,
    publisher: Arc<dyn MirrorPublisher>,
}

impl MirrorExportJob {
    pub fn new(
        store: Arc<dyn RecordStore>,
        publisher: Arc<dyn MirrorPublisher>,
        settings: JobSettings,
    ) -> Self {
        Self {
            runner: SyncRunner::new(store, settings),
            publisher,
        }
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> JobReport {
        self.runner.run(self, shutdown).await
    }
}

#[async_trait]
impl BatchSink for MirrorExportJob {
    fn target(&self) -> SyncTarget {
        SyncTarget::Mirror
    }

    async fn deliver(&self, ctx: &RunContext, records: &[Record]) -> StoreResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            match MirrorRow::from_record(record) {
                Ok(row) => rows.push(row),
                Err(reason) => outcome.anomalies.push(RejectedRecord {
                    unique_id: record.unique_id.clone(),
                    reason,
                }),
            }
        }
        if rows.is_empty() {
            return Ok(outcome);
        }

        let shard_id = format!(
            "{}-{}-{:05}",
            ctx.started_at.format("%Y%m%dT%H%M%SZ"),
            &ctx.run_id.simple().to_string()[..8],
            ctx.batch_no
        );
        let policy = self.runner.settings().backoff;
        let shard = retry_with_backoff(&policy, "publish mirror shard", || {
            self.publisher.publish(&shard_id, &rows)
        })
        .await?;
        info!(
            shard = %shard.full.path,
            rows = shard.full.rows,
            anomalies = outcome.anomalies.len(),
            "mirror shard published"
        );
        outcome.accepted = rows.into_iter().map(|r| r.unique_id).collect();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use newsmirror_core::{TopicAssignment, UnitRef};
    use parquet::file::reader::{FileReader, SerializedFileReader};

    fn record(id: &str, title: &str) -> Record {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        Record {
            unique_id: id.into(),
            org_unit: UnitRef {
                id: 1,
                key: "mec".into(),
                name: "Ministério da Educação".into(),
            },
            topics: TopicAssignment::default(),
            title: title.into(),
            url: Some(format!("https://example.gov/{id}")),
            image_url: None,
            video_url: None,
            category: Some("Notícias".into()),
            tags: vec!["educação".into(), "edital".into()],
            body: Some("corpo".into()),
            editorial_lead: None,
            subtitle: None,
            summary: None,
            published_at: at,
            source_updated_at: None,
            extracted_at: Some(at),
            created_at: at,
            updated_at: at,
            last_synced_to_index: None,
            last_synced_to_mirror: None,
        }
    }

    #[test]
    fn blank_title_is_an_anomaly() {
        let err = MirrorRow::from_record(&record("a", "  ")).unwrap_err();
        assert!(err.contains("title"));
        assert!(MirrorRow::from_record(&record("a", "ok")).is_ok());
    }

    #[tokio::test]
    async fn publish_writes_both_shards_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = ParquetDirectoryMirror::new(dir.path());
        let rows: Vec<MirrorRow> = ["a", "b", "c"]
            .iter()
            .map(|id| MirrorRow::from_record(&record(id, "Titulo")).unwrap())
            .collect();

        let shard = mirror.publish("s1", &rows).await.unwrap();
        assert_eq!(shard.full.path, "full/shard-s1.parquet");
        assert_eq!(shard.reduced.path, "reduced/shard-s1.parquet");

        let bytes = std::fs::read(dir.path().join(&shard.full.path)).unwrap();
        assert_eq!(shard.full.bytes, bytes.len() as u64);
        assert_eq!(shard.full.sha256, sha256_hex(&bytes));

        let reader = SerializedFileReader::new(std::fs::File::open(dir.path().join(&shard.reduced.path)).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 3);
        assert_eq!(reader.metadata().file_metadata().schema_descr().num_columns(), 4);

        let manifest = mirror.read_manifest().await.unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.total_rows("full"), 3);

        mirror.publish("s2", &rows[..1]).await.unwrap();
        let manifest = mirror.read_manifest().await.unwrap();
        assert_eq!(manifest.files.len(), 4);
        assert_eq!(manifest.total_rows("reduced"), 4);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("full"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
