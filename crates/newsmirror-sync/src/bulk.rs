//! Historical backfill straight into the primary store.

use std::future::Future;
use std::path::Path;

use anyhow::{Context, Result};
use newsmirror_core::{
    parse_timestamp, NewRecord, ReferenceData, StoreError, StoreResult, TopicCodes,
};
use newsmirror_storage::{retry_with_backoff, BackoffPolicy, MaintenanceControl, RecordStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Maintenance relaxed for the lifetime of a load.
///
/// Prefer [`BulkLoadSession::run`], which restores on every exit path. A session dropped
/// without [`BulkLoadSession::finish`] logs a warning; the store stays relaxed until
/// `restore_maintenance` runs.
pub struct BulkLoadSession<'a> {
    control: &'a dyn MaintenanceControl,
    finished: bool,
}

impl<'a> BulkLoadSession<'a> {
    pub async fn begin(control: &'a dyn MaintenanceControl) -> StoreResult<BulkLoadSession<'a>> {
        if let Err(err) = control.relax_maintenance().await {
            // Relax may have dropped part of the indexes before failing.
            if let Err(restore) = control.restore_maintenance().await {
                warn!(error = %restore, "restore after failed relax also failed");
            }
            return Err(err);
        }
        info!("maintenance relaxed for bulk load");
        Ok(Self {
            control,
            finished: false,
        })
    }

    pub async fn finish(mut self) -> StoreResult<()> {
        self.finished = true;
        self.control.restore_maintenance().await?;
        info!("maintenance restored after bulk load");
        Ok(())
    }

    /// Relax, run `load`, then restore whether or not the load succeeded.
    pub async fn run<T, F, Fut>(control: &'a dyn MaintenanceControl, load: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = Self::begin(control)
            .await
            .context("relaxing maintenance before bulk load")?;
        let loaded = load().await;
        let restored = session.finish().await;
        match (loaded, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => {
                Err(anyhow::Error::new(err).context("restoring maintenance after bulk load"))
            }
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(restore)) => {
                Err(err.context(format!("maintenance restore also failed: {restore}")))
            }
        }
    }
}

impl Drop for BulkLoadSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("bulk load session dropped while maintenance is relaxed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkLoadOptions {
    pub batch_size: usize,
    /// Stop after this many non-blank input rows.
    pub max_records: Option<usize>,
    /// Parse and validate only.
    pub dry_run: bool,
    pub relax_maintenance: bool,
    pub backoff: BackoffPolicy,
}

impl Default for BulkLoadOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_records: None,
            dry_run: false,
            relax_maintenance: true,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    pub line: usize,
    pub unique_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkLoadReport {
    pub rows_read: u64,
    pub valid: u64,
    pub written: u64,
    /// Valid rows whose `unique_id` already existed.
    pub already_present: u64,
    pub skipped: Vec<SkippedRow>,
    pub dry_run: bool,
}

/// One JSONL line of a historical export. Aliases cover the legacy dataset column names.
#[derive(Debug, Deserialize)]
struct LegacyRow {
    unique_id: Option<String>,
    #[serde(alias = "agency")]
    org_unit_key: Option<String>,
    title: Option<String>,
    published_at: Option<String>,
    url: Option<String>,
    #[serde(alias = "image")]
    image_url: Option<String>,
    video_url: Option<String>,
    category: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(alias = "content")]
    body: Option<String>,
    editorial_lead: Option<String>,
    subtitle: Option<String>,
    summary: Option<String>,
    #[serde(alias = "theme_1_level_1_code")]
    topic_l1: Option<String>,
    #[serde(alias = "theme_1_level_2_code")]
    topic_l2: Option<String>,
    #[serde(alias = "theme_1_level_3_code")]
    topic_l3: Option<String>,
    #[serde(alias = "most_specific_theme_code")]
    most_specific_topic: Option<String>,
    #[serde(alias = "updated_datetime")]
    source_updated_at: Option<String>,
    #[serde(alias = "extracted_datetime")]
    extracted_at: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_row(line_no: usize, line: &str, refs: &ReferenceData) -> Result<NewRecord, SkippedRow> {
    let skip = |unique_id: Option<String>, reason: String| SkippedRow {
        line: line_no,
        unique_id,
        reason,
    };
    let row: LegacyRow =
        serde_json::from_str(line).map_err(|err| skip(None, format!("malformed row: {err}")))?;
    let unique_id = non_blank(row.unique_id);
    let Some(id) = unique_id.clone() else {
        return Err(skip(None, "missing unique_id".into()));
    };
    let reject = |reason: &str| skip(Some(id.clone()), reason.to_string());

    let org_unit_key = non_blank(row.org_unit_key).ok_or_else(|| reject("missing org_unit_key"))?;
    if refs.unit_by_key(&org_unit_key).is_none() {
        return Err(reject("unknown organizational unit"));
    }
    let title = non_blank(row.title).ok_or_else(|| reject("missing title"))?;
    let published_at = row
        .published_at
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or_else(|| reject("missing or unparsable published_at"))?;

    let record = NewRecord {
        unique_id: id.clone(),
        org_unit_key,
        topics: TopicCodes {
            l1: non_blank(row.topic_l1),
            l2: non_blank(row.topic_l2),
            l3: non_blank(row.topic_l3),
            most_specific: non_blank(row.most_specific_topic),
        },
        title,
        url: non_blank(row.url),
        image_url: non_blank(row.image_url),
        video_url: non_blank(row.video_url),
        category: non_blank(row.category),
        tags: row.tags.unwrap_or_default(),
        body: row.body,
        editorial_lead: non_blank(row.editorial_lead),
        subtitle: non_blank(row.subtitle),
        summary: non_blank(row.summary),
        published_at,
        source_updated_at: row.source_updated_at.as_deref().and_then(parse_timestamp),
        extracted_at: row.extracted_at.as_deref().and_then(parse_timestamp),
    };
    record
        .validate()
        .map_err(|err: StoreError| skip(Some(id.clone()), err.to_string()))?;
    Ok(record)
}

/// Streams a JSONL file into the store in insert-only batches.
pub struct BulkLoader<'a> {
    store: &'a dyn RecordStore,
    maintenance: Option<&'a dyn MaintenanceControl>,
    options: BulkLoadOptions,
}

impl<'a> BulkLoader<'a> {
    pub fn new(store: &'a dyn RecordStore, options: BulkLoadOptions) -> Self {
        Self {
            store,
            maintenance: None,
            options,
        }
    }

    pub fn with_maintenance(mut self, control: &'a dyn MaintenanceControl) -> Self {
        self.maintenance = Some(control);
        self
    }

    pub async fn load_file(&self, path: &Path) -> Result<BulkLoadReport> {
        let refs = self
            .store
            .reference()
            .await
            .context("loading reference data")?;
        let relax = self.options.relax_maintenance && !self.options.dry_run;
        let report = match self.maintenance.filter(|_| relax) {
            Some(control) => BulkLoadSession::run(control, || self.load_rows(path, &refs)).await?,
            None => self.load_rows(path, &refs).await?,
        };
        info!(
            path = %path.display(),
            rows_read = report.rows_read,
            written = report.written,
            already_present = report.already_present,
            skipped = report.skipped.len(),
            dry_run = report.dry_run,
            "bulk load finished"
        );
        Ok(report)
    }

    async fn load_rows(&self, path: &Path, refs: &ReferenceData) -> Result<BulkLoadReport> {
        let file = fs::File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();
        let batch_size = self.options.batch_size.max(1);
        let mut report = BulkLoadReport {
            dry_run: self.options.dry_run,
            ..BulkLoadReport::default()
        };
        let mut batch = Batch::with_capacity(batch_size);
        let mut line_no = 0usize;

        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("reading {}", path.display()))?
        {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            if self
                .options
                .max_records
                .is_some_and(|max| report.rows_read as usize >= max)
            {
                break;
            }
            report.rows_read += 1;
            match parse_row(line_no, &line, refs) {
                Ok(record) => {
                    report.valid += 1;
                    batch.push(line_no, record);
                    if batch.records.len() >= batch_size {
                        self.flush(&mut batch, &mut report).await?;
                    }
                }
                Err(skipped) => {
                    warn!(
                        line = skipped.line,
                        unique_id = skipped.unique_id.as_deref().unwrap_or("-"),
                        reason = %skipped.reason,
                        "skipping row"
                    );
                    report.skipped.push(skipped);
                }
            }
        }
        self.flush(&mut batch, &mut report).await?;
        report.skipped.sort_by_key(|row| row.line);
        Ok(report)
    }

    /// Writes the batch. A chunk the store refuses as invalid is halved until the
    /// offending rows are isolated; those land in `report.skipped`.
    async fn flush(&self, batch: &mut Batch, report: &mut BulkLoadReport) -> Result<()> {
        if batch.records.is_empty() || self.options.dry_run {
            batch.clear();
            return Ok(());
        }
        let mut ranges = vec![(0, batch.records.len())];
        while let Some((start, end)) = ranges.pop() {
            let rows = &batch.records[start..end];
            let inserted = retry_with_backoff(&self.options.backoff, "bulk insert", || {
                self.store.insert(rows, false)
            })
            .await;
            match inserted {
                Ok(summary) => {
                    report.written += summary.written;
                    report.already_present += summary.skipped;
                }
                Err(StoreError::InvalidArgument(reason)) if end - start == 1 => {
                    let skipped = SkippedRow {
                        line: batch.lines[start],
                        unique_id: Some(rows[0].unique_id.clone()),
                        reason,
                    };
                    warn!(
                        line = skipped.line,
                        unique_id = rows[0].unique_id.as_str(),
                        reason = %skipped.reason,
                        "store rejected row"
                    );
                    report.skipped.push(skipped);
                }
                Err(StoreError::InvalidArgument(_)) => {
                    let mid = start + (end - start) / 2;
                    ranges.push((mid, end));
                    ranges.push((start, mid));
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err).context(format!(
                        "inserting batch ending at row {}",
                        report.rows_read
                    )));
                }
            }
        }
        info!(
            rows_read = report.rows_read,
            written = report.written,
            "bulk load progress"
        );
        batch.clear();
        Ok(())
    }
}

/// Parsed rows awaiting insert, with the input line each came from.
struct Batch {
    lines: Vec<usize>,
    records: Vec<NewRecord>,
}

impl Batch {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Vec::with_capacity(capacity),
            records: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, line: usize, record: NewRecord) {
        self.lines.push(line);
        self.records.push(record);
    }

    fn clear(&mut self) {
        self.lines.clear();
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use newsmirror_core::{OrganizationalUnit, Topic};
    use newsmirror_storage::MemoryStore;
    use std::io::Write;

    fn store() -> MemoryStore {
        MemoryStore::with_reference(
            vec![OrganizationalUnit {
                id: 1,
                key: "mec".into(),
                name: "Ministério da Educação".into(),
                unit_type: None,
                parent_key: None,
            }],
            Vec::<Topic>::new(),
        )
    }

    fn refs() -> ReferenceData {
        ReferenceData::new(
            vec![OrganizationalUnit {
                id: 1,
                key: "mec".into(),
                name: "Ministério da Educação".into(),
                unit_type: None,
                parent_key: None,
            }],
            vec![],
        )
    }

    #[test]
    fn legacy_column_names_are_accepted() {
        let line = r#"{"unique_id":"x1","agency":"mec","title":"T","published_at":"2024-05-01 10:00:00","content":"B","theme_1_level_1_code":"01","image":"https://img"}"#;
        let record = parse_row(1, line, &refs()).unwrap();
        assert_eq!(record.org_unit_key, "mec");
        assert_eq!(record.body.as_deref(), Some("B"));
        assert_eq!(record.topics.l1.as_deref(), Some("01"));
        assert_eq!(record.image_url.as_deref(), Some("https://img"));
    }

    #[test]
    fn invalid_rows_carry_line_and_reason() {
        let refs = refs();
        let missing = parse_row(3, r#"{"agency":"mec","title":"T","published_at":"2024-05-01"}"#, &refs)
            .unwrap_err();
        assert_eq!(missing.line, 3);
        assert_eq!(missing.reason, "missing unique_id");

        let unknown = parse_row(
            4,
            r#"{"unique_id":"u","agency":"nope","title":"T","published_at":"2024-05-01"}"#,
            &refs,
        )
        .unwrap_err();
        assert_eq!(unknown.unique_id.as_deref(), Some("u"));
        assert_eq!(unknown.reason, "unknown organizational unit");

        let date = parse_row(5, r#"{"unique_id":"d","agency":"mec","title":"T","published_at":"ontem"}"#, &refs)
            .unwrap_err();
        assert!(date.reason.contains("published_at"));

        assert!(parse_row(6, "{not json", &refs).unwrap_err().reason.starts_with("malformed"));
    }

    #[tokio::test]
    async fn session_restores_when_the_load_fails() {
        let store = store();
        let result: Result<()> = BulkLoadSession::run(&store, || async {
            assert!(store.maintenance_relaxed());
            anyhow::bail!("disk on fire")
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("disk on fire"));
        assert!(!store.maintenance_relaxed());
        assert_eq!(store.maintenance_cycles(), 1);
    }

    #[tokio::test]
    async fn dry_run_and_max_records_write_nothing_beyond_the_limit() {
        let store = store();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..5 {
            writeln!(
                file,
                r#"{{"unique_id":"id-{i}","org_unit_key":"mec","title":"T{i}","published_at":"2024-05-0{}T10:00:00Z"}}"#,
                i + 1
            )
            .unwrap();
        }
        writeln!(file).unwrap();
        file.flush().unwrap();

        let dry = BulkLoader::new(
            &store,
            BulkLoadOptions {
                dry_run: true,
                ..BulkLoadOptions::default()
            },
        )
        .with_maintenance(&store)
        .load_file(file.path())
        .await
        .unwrap();
        assert_eq!(dry.valid, 5);
        assert_eq!(dry.written, 0);
        assert!(store.is_empty());
        assert_eq!(store.maintenance_cycles(), 0);

        let capped = BulkLoader::new(
            &store,
            BulkLoadOptions {
                max_records: Some(3),
                batch_size: 2,
                backoff: BackoffPolicy::immediate(0),
                ..BulkLoadOptions::default()
            },
        )
        .with_maintenance(&store)
        .load_file(file.path())
        .await
        .unwrap();
        assert_eq!(capped.rows_read, 3);
        assert_eq!(capped.written, 3);
        assert_eq!(store.len(), 3);
        assert_eq!(store.maintenance_cycles(), 1);
    }

    #[tokio::test]
    async fn rows_the_store_rejects_are_skipped_not_fatal() {
        let store = store();
        store.reject_unique_id("id-3");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..6 {
            writeln!(
                file,
                r#"{{"unique_id":"id-{i}","org_unit_key":"mec","title":"T{i}","published_at":"2024-05-0{}T10:00:00Z"}}"#,
                i + 1
            )
            .unwrap();
        }
        writeln!(file, r#"{{"unique_id":"","org_unit_key":"mec"}}"#).unwrap();
        file.flush().unwrap();

        let report = BulkLoader::new(
            &store,
            BulkLoadOptions {
                batch_size: 4,
                relax_maintenance: false,
                backoff: BackoffPolicy::immediate(0),
                ..BulkLoadOptions::default()
            },
        )
        .load_file(file.path())
        .await
        .unwrap();

        assert_eq!(report.rows_read, 7);
        assert_eq!(report.valid, 6);
        assert_eq!(report.written, 5);
        assert_eq!(store.len(), 5);
        assert!(store.get_by_unique_id("id-3").await.unwrap().is_none());
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.skipped[0].line, 4);
        assert_eq!(report.skipped[0].unique_id.as_deref(), Some("id-3"));
        assert!(report.skipped[0].reason.contains("id-3"));
        assert_eq!(report.skipped[1].line, 7);
    }
}
