use async_trait::async_trait;
use newsmirror_core::{FieldAssignment, Record, RecordPatch, StoreResult, TopicCodes};
use newsmirror_storage::RecordStore;
use tracing::{debug, warn};

/// Summary and topic classification produced for one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrichment {
    pub summary: Option<String>,
    pub topics: TopicCodes,
}

impl Enrichment {
    /// Only fields the provider actually produced are written.
    pub fn to_patch(&self) -> Option<RecordPatch> {
        let mut fields = Vec::new();
        if let Some(summary) = self.summary.as_ref().filter(|s| !s.trim().is_empty()) {
            fields.push(FieldAssignment::Summary(Some(summary.clone())));
        }
        let topics: [(&Option<String>, fn(Option<String>) -> FieldAssignment); 4] = [
            (&self.topics.l1, FieldAssignment::TopicL1),
            (&self.topics.l2, FieldAssignment::TopicL2),
            (&self.topics.l3, FieldAssignment::TopicL3),
            (&self.topics.most_specific, FieldAssignment::MostSpecificTopic),
        ];
        for (code, build) in topics {
            if let Some(code) = code {
                fields.push(build(Some(code.clone())));
            }
        }
        RecordPatch::new(fields).ok()
    }
}

#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// `Ok(None)` when the provider has nothing to add for this record.
    async fn enrich(&self, record: &Record) -> StoreResult<Option<Enrichment>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichReport {
    pub enriched: u64,
    pub unchanged: u64,
    pub failed: u64,
}

/// Apply provider output to records through the write path. Each update bumps `updated_at`,
/// so enriched rows become pending for both sync targets.
pub async fn enrich_records(
    store: &dyn RecordStore,
    provider: &dyn EnrichmentProvider,
    records: &[Record],
) -> StoreResult<EnrichReport> {
    let mut report = EnrichReport::default();
    for record in records {
        let patch = match provider.enrich(record).await {
            Ok(Some(enrichment)) => enrichment.to_patch(),
            Ok(None) => None,
            Err(err) if err.is_retryable() => return Err(err),
            Err(err) => {
                warn!(unique_id = %record.unique_id, error = %err, "enrichment failed");
                report.failed += 1;
                continue;
            }
        };
        let Some(patch) = patch else {
            report.unchanged += 1;
            continue;
        };
        match store.update(&record.unique_id, &patch).await {
            Ok(true) => report.enriched += 1,
            Ok(false) => report.unchanged += 1,
            Err(err) if err.is_retryable() => return Err(err),
            Err(err) => {
                warn!(unique_id = %record.unique_id, error = %err, "enrichment rejected by store");
                report.failed += 1;
            }
        }
    }
    debug!(?report, "enrichment pass finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use newsmirror_core::{NewRecord, OrganizationalUnit, StoreError, SyncTarget, Topic};
    use newsmirror_storage::MemoryStore;

    struct FixedProvider;

    #[async_trait]
    impl EnrichmentProvider for FixedProvider {
        async fn enrich(&self, record: &Record) -> StoreResult<Option<Enrichment>> {
            match record.unique_id.as_str() {
                "known" => Ok(Some(Enrichment {
                    summary: Some("Resumo".into()),
                    topics: TopicCodes {
                        l1: Some("01".into()),
                        ..TopicCodes::default()
                    },
                })),
                "bogus" => Ok(Some(Enrichment {
                    summary: None,
                    topics: TopicCodes {
                        l1: Some("99".into()),
                        ..TopicCodes::default()
                    },
                })),
                "broken" => Err(StoreError::Internal("model crashed".into())),
                _ => Ok(None),
            }
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::with_reference(
            vec![OrganizationalUnit {
                id: 1,
                key: "mec".into(),
                name: "Ministério da Educação".into(),
                unit_type: None,
                parent_key: None,
            }],
            vec![Topic {
                id: 1,
                code: "01".into(),
                label: "Educação".into(),
                level: 1,
                parent_code: None,
            }],
        )
    }

    fn new_record(id: &str) -> NewRecord {
        NewRecord {
            unique_id: id.into(),
            org_unit_key: "mec".into(),
            topics: TopicCodes::default(),
            title: format!("Titulo {id}"),
            url: None,
            image_url: None,
            video_url: None,
            category: None,
            tags: vec![],
            body: None,
            editorial_lead: None,
            subtitle: None,
            summary: None,
            published_at: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            source_updated_at: None,
            extracted_at: None,
        }
    }

    #[test]
    fn empty_enrichment_yields_no_patch() {
        assert!(Enrichment::default().to_patch().is_none());
    }

    #[tokio::test]
    async fn enrichment_updates_known_rows_and_counts_the_rest() {
        let store = store();
        let batch: Vec<NewRecord> = ["known", "bogus", "broken", "quiet"]
            .iter()
            .map(|id| new_record(id))
            .collect();
        store.insert(&batch, false).await.unwrap();
        let records = store.records_pending_sync(SyncTarget::SearchIndex, 10).await.unwrap();

        let report = enrich_records(&store, &FixedProvider, &records).await.unwrap();
        assert_eq!(
            report,
            EnrichReport {
                enriched: 1,
                unchanged: 1,
                failed: 2,
            }
        );
        let known = store.get_by_unique_id("known").await.unwrap().unwrap();
        assert_eq!(known.summary.as_deref(), Some("Resumo"));
        assert_eq!(known.topics.l1.map(|t| t.label).as_deref(), Some("Educação"));
    }
}
