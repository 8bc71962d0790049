use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Datelike;
use newsmirror_core::{iso_week_id, Record, StoreError, StoreResult, SyncTarget};
use newsmirror_storage::{
    reqwest_to_store_error, retry_with_backoff, status_to_store_error, HttpClientConfig, RecordStore,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::runner::{BatchOutcome, BatchSink, JobSettings, RunContext, SyncRunner};
use crate::{JobReport, RejectedRecord};

/// Text that represents a record for embedding and full-text search.
///
/// Title plus summary when a summary exists; otherwise title plus the first `body_chars`
/// characters of the body.
pub fn searchable_text(record: &Record, body_chars: usize) -> String {
    let title = record.title.trim();
    let summary = record.summary.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let tail = match summary {
        Some(summary) => Some(summary.to_string()),
        None => record
            .body
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty() && body_chars > 0)
            .map(|body| body.chars().take(body_chars).collect::<String>()),
    };
    match tail {
        Some(tail) => format!("{title} {tail}"),
        None => title.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub id: String,
    pub unique_id: String,
    pub title: String,
    pub search_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editorial_lead: Option<String>,
    pub org_unit_key: String,
    pub org_unit_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_l1_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_l1_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_l2_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_l2_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_l3_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_l3_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_specific_topic_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_specific_topic_label: Option<String>,
    /// Epoch seconds.
    pub published_at: i64,
    pub published_year: i32,
    pub published_month: u32,
    /// ISO week as `YYYYWW`.
    pub published_week: u32,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_at: Option<i64>,
    pub content_embedding: Vec<f32>,
}

impl SearchDocument {
    pub fn from_record(record: &Record, search_text: String, embedding: Vec<f32>) -> Self {
        let topics = &record.topics;
        let code = |t: &Option<newsmirror_core::TopicRef>| t.as_ref().map(|t| t.code.clone());
        let label = |t: &Option<newsmirror_core::TopicRef>| t.as_ref().map(|t| t.label.clone());
        Self {
            id: record.unique_id.clone(),
            unique_id: record.unique_id.clone(),
            title: record.title.clone(),
            search_text,
            url: record.url.clone(),
            image_url: record.image_url.clone(),
            video_url: record.video_url.clone(),
            category: record.category.clone(),
            tags: record.tags.clone(),
            content: record.body.clone(),
            summary: record.summary.clone(),
            subtitle: record.subtitle.clone(),
            editorial_lead: record.editorial_lead.clone(),
            org_unit_key: record.org_unit.key.clone(),
            org_unit_name: record.org_unit.name.clone(),
            topic_l1_code: code(&topics.l1),
            topic_l1_label: label(&topics.l1),
            topic_l2_code: code(&topics.l2),
            topic_l2_label: label(&topics.l2),
            topic_l3_code: code(&topics.l3),
            topic_l3_label: label(&topics.l3),
            most_specific_topic_code: code(&topics.most_specific),
            most_specific_topic_label: label(&topics.most_specific),
            published_at: record.published_at.timestamp(),
            published_year: record.published_at.year(),
            published_month: record.published_at.month(),
            published_week: iso_week_id(record.published_at),
            updated_at: record.updated_at.timestamp(),
            extracted_at: record.extracted_at.map(|t| t.timestamp()),
            content_embedding: embedding,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentResult {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Per-document outcome of one bulk upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexResponse {
    pub results: Vec<DocumentResult>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the collection when it does not exist yet.
    async fn ensure_collection(&self, embedding_dim: usize) -> StoreResult<()>;

    async fn upsert_documents(&self, docs: &[SearchDocument]) -> StoreResult<IndexResponse>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> StoreResult<Vec<Vec<f32>>>;
}

pub struct TypesenseIndex {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    collection: String,
}

impl TypesenseIndex {
    pub fn new(http: &HttpClientConfig, base_url: &str, api_key: &str, collection: &str) -> Result<Self> {
        Ok(Self {
            client: http.build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            collection: collection.to_string(),
        })
    }

    pub fn collection_schema(&self, embedding_dim: usize) -> serde_json::Value {
        collection_schema(&self.collection, embedding_dim)
    }
}

pub fn collection_schema(name: &str, embedding_dim: usize) -> serde_json::Value {
    let facet = |name: &str| json!({ "name": name, "type": "string", "facet": true, "optional": true });
    json!({
        "name": name,
        "default_sorting_field": "published_at",
        "fields": [
            { "name": "unique_id", "type": "string" },
            { "name": "title", "type": "string" },
            { "name": "search_text", "type": "string" },
            { "name": "content", "type": "string", "optional": true },
            { "name": "summary", "type": "string", "optional": true },
            { "name": "subtitle", "type": "string", "optional": true },
            { "name": "editorial_lead", "type": "string", "optional": true },
            { "name": "url", "type": "string", "optional": true, "index": false },
            { "name": "image_url", "type": "string", "optional": true, "index": false },
            { "name": "video_url", "type": "string", "optional": true, "index": false },
            { "name": "tags", "type": "string[]", "facet": true, "optional": true },
            facet("category"),
            { "name": "org_unit_key", "type": "string", "facet": true },
            { "name": "org_unit_name", "type": "string", "facet": true },
            facet("topic_l1_code"),
            facet("topic_l1_label"),
            facet("topic_l2_code"),
            facet("topic_l2_label"),
            facet("topic_l3_code"),
            facet("topic_l3_label"),
            facet("most_specific_topic_code"),
            facet("most_specific_topic_label"),
            { "name": "published_at", "type": "int64" },
            { "name": "published_year", "type": "int32", "facet": true },
            { "name": "published_month", "type": "int32", "facet": true },
            { "name": "published_week", "type": "int32", "facet": true },
            { "name": "updated_at", "type": "int64" },
            { "name": "extracted_at", "type": "int64", "optional": true },
            { "name": "content_embedding", "type": "float[]", "num_dim": embedding_dim },
        ]
    })
}

#[derive(Debug, Deserialize)]
struct ImportLine {
    success: bool,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse a JSONL import response into one result per batch id, in batch order.
///
/// Lines are positional; an `id` on the line wins when present. Ids outside the batch are
/// ignored, the first line for an id counts, and batch ids with no line are reported failed.
pub fn parse_import_response(body: &str, ids: &[String]) -> StoreResult<IndexResponse> {
    let mut by_id: HashMap<&str, DocumentResult> = HashMap::with_capacity(ids.len());
    for (pos, line) in body.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        let parsed: ImportLine = serde_json::from_str(line)
            .map_err(|err| StoreError::Internal(format!("unparsable import line {line:?}: {err}")))?;
        let id = match (&parsed.id, ids.get(pos)) {
            (Some(id), _) => id.as_str(),
            (None, Some(id)) => id.as_str(),
            (None, None) => continue,
        };
        let Some(id) = ids.iter().find(|known| known.as_str() == id) else {
            warn!(id, "import response names a document outside the batch");
            continue;
        };
        by_id.entry(id.as_str()).or_insert(DocumentResult {
            id: id.clone(),
            success: parsed.success,
            error: parsed.error,
        });
    }
    let results = ids
        .iter()
        .map(|id| {
            by_id.remove(id.as_str()).unwrap_or_else(|| DocumentResult {
                id: id.clone(),
                success: false,
                error: Some("no result returned for document".into()),
            })
        })
        .collect();
    Ok(IndexResponse { results })
}

#[async_trait]
impl SearchIndex for TypesenseIndex {
    async fn ensure_collection(&self, embedding_dim: usize) -> StoreResult<()> {
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let resp = self
            .client
            .get(&url)
            .header("X-TYPESENSE-API-KEY", &self.api_key)
            .send()
            .instrument(info_span!("typesense_get_collection", collection = %self.collection))
            .await
            .map_err(|e| reqwest_to_store_error("get collection", e))?;
        match resp.status() {
            StatusCode::OK => {
                debug!(collection = %self.collection, "collection exists");
                return Ok(());
            }
            StatusCode::NOT_FOUND => {}
            status => {
                let body = resp.text().await.unwrap_or_default();
                return Err(status_to_store_error("get collection", status, &body));
            }
        }

        let resp = self
            .client
            .post(format!("{}/collections", self.base_url))
            .header("X-TYPESENSE-API-KEY", &self.api_key)
            .json(&self.collection_schema(embedding_dim))
            .send()
            .await
            .map_err(|e| reqwest_to_store_error("create collection", e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_to_store_error("create collection", status, &body));
        }
        info!(collection = %self.collection, embedding_dim, "created search collection");
        Ok(())
    }

    async fn upsert_documents(&self, docs: &[SearchDocument]) -> StoreResult<IndexResponse> {
        let mut body = String::new();
        for doc in docs {
            let line = serde_json::to_string(doc)
                .map_err(|e| StoreError::Internal(format!("serialize document {}: {e}", doc.id)))?;
            body.push_str(&line);
            body.push('\n');
        }
        let url = format!(
            "{}/collections/{}/documents/import?action=upsert&return_id=true",
            self.base_url, self.collection
        );
        let resp = self
            .client
            .post(url)
            .header("X-TYPESENSE-API-KEY", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .instrument(info_span!("typesense_import", collection = %self.collection, docs = docs.len()))
            .await
            .map_err(|e| reqwest_to_store_error("import documents", e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| reqwest_to_store_error("read import response", e))?;
        if !status.is_success() {
            return Err(status_to_store_error("import documents", status, &text));
        }
        let ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
        parse_import_response(&text, &ids)
    }
}

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbeddingProvider {
    pub fn new(
        http: &HttpClientConfig,
        base_url: &str,
        api_key: Option<String>,
        dimension: usize,
    ) -> Result<Self> {
        Ok(Self {
            client: http.build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> StoreResult<Vec<Vec<f32>>> {
        let mut req = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(&EmbedRequest { texts });
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }
        let resp = req
            .send()
            .instrument(info_span!("embeddings_generate", texts = texts.len()))
            .await
            .map_err(|e| reqwest_to_store_error("generate embeddings", e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_to_store_error("generate embeddings", status, &body));
        }
        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Internal(format!("decode embeddings: {e}")))?;
        Ok(parsed.embeddings)
    }
}

/// Pushes pending records to the search index with embeddings attached.
pub struct IndexSyncJob {
    runner: SyncRunner,
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    body_chars: usize,
}

impl IndexSyncJob {
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: JobSettings,
        body_chars: usize,
    ) -> Self {
        Self {
            runner: SyncRunner::new(store, settings),
            index,
            embedder,
            body_chars,
        }
    }

    pub async fn ensure_collection(&self) -> StoreResult<()> {
        self.index.ensure_collection(self.embedder.dimension()).await
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> JobReport {
        self.runner.run(self, shutdown).await
    }

    async fn embed_checked(&self, texts: &[String]) -> StoreResult<Vec<Vec<f32>>> {
        let policy = self.runner.settings().backoff;
        let embeddings =
            retry_with_backoff(&policy, "generate embeddings", || self.embedder.embed(texts)).await?;
        if embeddings.len() != texts.len() {
            return Err(StoreError::Internal(format!(
                "embedding service returned {} vectors for {} texts",
                embeddings.len(),
                texts.len()
            )));
        }
        let dim = self.embedder.dimension();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dim) {
            return Err(StoreError::Internal(format!(
                "embedding dimension {} does not match configured {dim}",
                bad.len()
            )));
        }
        Ok(embeddings)
    }
}

#[async_trait]
impl BatchSink for IndexSyncJob {
    fn target(&self) -> SyncTarget {
        SyncTarget::SearchIndex
    }

    async fn deliver(&self, ctx: &RunContext, records: &[Record]) -> StoreResult<BatchOutcome> {
        let texts: Vec<String> = records
            .iter()
            .map(|r| searchable_text(r, self.body_chars))
            .collect();
        let embeddings = self.embed_checked(&texts).await?;
        let docs: Vec<SearchDocument> = records
            .iter()
            .zip(texts)
            .zip(embeddings)
            .map(|((record, text), embedding)| SearchDocument::from_record(record, text, embedding))
            .collect();

        let policy = self.runner.settings().backoff;
        let response =
            retry_with_backoff(&policy, "upsert documents", || self.index.upsert_documents(&docs))
                .await?;

        let mut outcome = BatchOutcome::default();
        for result in response.results {
            if result.success {
                outcome.accepted.push(result.id);
            } else {
                outcome.rejected.push(RejectedRecord {
                    unique_id: result.id,
                    reason: result.error.unwrap_or_else(|| "rejected by index".into()),
                });
            }
        }
        debug!(
            batch_no = ctx.batch_no,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            "index batch delivered"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use newsmirror_core::{TopicAssignment, TopicRef, UnitRef};

    fn record() -> Record {
        let at = Utc.with_ymd_and_hms(2024, 12, 30, 9, 0, 0).unwrap();
        Record {
            unique_id: "abc".into(),
            org_unit: UnitRef {
                id: 1,
                key: "mec".into(),
                name: "Ministério da Educação".into(),
            },
            topics: TopicAssignment {
                l1: Some(TopicRef {
                    id: 1,
                    code: "01".into(),
                    label: "Educação".into(),
                }),
                ..TopicAssignment::default()
            },
            title: "Novo edital".into(),
            url: None,
            image_url: None,
            video_url: None,
            category: None,
            tags: vec![],
            body: Some("ação".repeat(50)),
            editorial_lead: None,
            subtitle: None,
            summary: None,
            published_at: at,
            source_updated_at: None,
            extracted_at: None,
            created_at: at,
            updated_at: at,
            last_synced_to_index: None,
            last_synced_to_mirror: None,
        }
    }

    #[test]
    fn searchable_text_prefers_summary() {
        let mut r = record();
        r.summary = Some("Resumo curto".into());
        assert_eq!(searchable_text(&r, 10), "Novo edital Resumo curto");
    }

    #[test]
    fn searchable_text_truncates_body_on_char_boundaries() {
        let r = record();
        let text = searchable_text(&r, 6);
        assert_eq!(text, "Novo edital açãoaç");
    }

    #[test]
    fn searchable_text_falls_back_to_title() {
        let mut r = record();
        r.body = Some("   ".into());
        r.summary = Some("".into());
        assert_eq!(searchable_text(&r, 500), "Novo edital");
    }

    #[test]
    fn document_carries_week_and_facets() {
        let doc = SearchDocument::from_record(&record(), "t".into(), vec![0.5; 3]);
        assert_eq!(doc.published_week, 202501);
        assert_eq!(doc.published_year, 2024);
        assert_eq!(doc.published_month, 12);
        assert_eq!(doc.topic_l1_code.as_deref(), Some("01"));
        assert_eq!(doc.org_unit_name, "Ministério da Educação");
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("topic_l2_code").is_none());
    }

    #[test]
    fn import_response_marks_failures_and_missing_lines() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let body = "{\"success\":true,\"id\":\"a\"}\n{\"success\":false,\"error\":\"bad field\"}\n";
        let parsed = parse_import_response(body, &ids).unwrap();
        assert_eq!(parsed.results.len(), 3);
        assert!(parsed.results[0].success);
        assert_eq!(parsed.results[1].id, "b");
        assert_eq!(parsed.results[1].error.as_deref(), Some("bad field"));
        assert_eq!(parsed.results[2].id, "c");
        assert!(!parsed.results[2].success);
    }

    #[test]
    fn import_response_ignores_foreign_and_repeated_ids() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let body = "{\"success\":true,\"id\":\"zzz\"}\n\
                    {\"success\":true,\"id\":\"a\"}\n\
                    {\"success\":false,\"id\":\"a\",\"error\":\"late\"}\n\
                    {\"success\":true,\"id\":\"c\"}\n";
        let parsed = parse_import_response(body, &ids).unwrap();
        let summary: Vec<(&str, bool)> = parsed
            .results
            .iter()
            .map(|r| (r.id.as_str(), r.success))
            .collect();
        assert_eq!(summary, [("a", true), ("b", false), ("c", true)]);
        assert_eq!(
            parsed.results[1].error.as_deref(),
            Some("no result returned for document")
        );
    }

    #[test]
    fn schema_declares_embedding_dimension() {
        let schema = collection_schema("news", 768);
        let fields = schema["fields"].as_array().unwrap();
        let embedding = fields
            .iter()
            .find(|f| f["name"] == "content_embedding")
            .unwrap();
        assert_eq!(embedding["num_dim"], 768);
    }
}
