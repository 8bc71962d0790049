//! The batch loop shared by every incremental job.
//!
//! Each batch is fetched by keyset position, delivered to a [`BatchSink`], and only the ids the
//! sink confirms are stamped. A row is stamped with the `updated_at` it was read with, and only
//! while it still carries it, so an edit committed while the batch is in flight leaves the row
//! pending for the next run whatever timestamp the writer gave it.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsmirror_core::{
    BatchStatus, PendingCursor, Record, StoreError, StoreResult, SyncLogEntry, SyncTarget,
    SyncedVersion,
};
use newsmirror_storage::{retry_with_backoff, BackoffPolicy, RecordStore};
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{JobReport, RejectedRecord, RunStatus};

#[derive(Debug, Clone, Copy)]
pub struct JobSettings {
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub batch_no: i32,
}

/// What a sink did with one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedRecord>,
    pub anomalies: Vec<RejectedRecord>,
}

/// A downstream that receives pending rows. Errors abort the run; per-row refusals do not.
#[async_trait]
pub trait BatchSink: Send + Sync {
    fn target(&self) -> SyncTarget;

    async fn deliver(&self, ctx: &RunContext, records: &[Record]) -> StoreResult<BatchOutcome>;
}

pub struct SyncRunner {
    store: Arc<dyn RecordStore>,
    settings: JobSettings,
}

impl SyncRunner {
    pub fn new(store: Arc<dyn RecordStore>, settings: JobSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub async fn run(&self, sink: &dyn BatchSink, shutdown: watch::Receiver<bool>) -> JobReport {
        let target = sink.target();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", target_name = %target, %run_id);
        let mut report = JobReport {
            run_id,
            target,
            started_at,
            finished_at: started_at,
            batches: 0,
            synced: 0,
            rejected: Vec::new(),
            anomalies: Vec::new(),
            status: RunStatus::NothingPending,
            error: None,
        };
        let outcome = self
            .drive(sink, &shutdown, &mut report)
            .instrument(span)
            .await;
        report.finished_at = Utc::now();
        report.status = match outcome {
            Err(err) => {
                report.error = Some(err.to_string());
                RunStatus::Aborted
            }
            Ok(Stop::Interrupted) => RunStatus::Interrupted,
            Ok(Stop::Drained) if !report.rejected.is_empty() || !report.anomalies.is_empty() => {
                RunStatus::CompletedWithExclusions
            }
            Ok(Stop::Drained) if report.synced == 0 => RunStatus::NothingPending,
            Ok(Stop::Drained) => RunStatus::Synced,
        };
        info!(
            target_name = %target,
            %run_id,
            status = ?report.status,
            batches = report.batches,
            synced = report.synced,
            rejected = report.rejected.len(),
            anomalies = report.anomalies.len(),
            "sync run finished"
        );
        report
    }

    async fn drive(
        &self,
        sink: &dyn BatchSink,
        shutdown: &watch::Receiver<bool>,
        report: &mut JobReport,
    ) -> StoreResult<Stop> {
        let target = sink.target();
        let policy = self.settings.backoff;
        let limit = self.settings.batch_size.max(1);
        let store = self.store.as_ref();
        let mut cursor: Option<PendingCursor> = None;

        loop {
            if *shutdown.borrow() {
                info!(batches = report.batches, "shutdown requested, stopping between batches");
                return Ok(Stop::Interrupted);
            }

            let batch_started = Utc::now();
            let after = cursor.as_ref();
            let records = retry_with_backoff(&policy, "fetch pending", || {
                store.pending_sync(target, after, limit)
            })
            .await?;
            if records.is_empty() {
                return Ok(Stop::Drained);
            }
            cursor = records.last().map(Record::pending_cursor);
            report.batches += 1;

            let ctx = RunContext {
                run_id: report.run_id,
                started_at: report.started_at,
                batch_no: report.batches as i32,
            };
            let delivered = sink.deliver(&ctx, &records).await;
            let outcome = match delivered {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.log_batch(&ctx, target, batch_started, records.len(), None, Some(&err))
                        .await;
                    return Err(err);
                }
            };

            let mut stamped = 0;
            if !outcome.accepted.is_empty() {
                let versions = delivered_versions(&records, &outcome.accepted);
                let marked = retry_with_backoff(&policy, "mark synced", || {
                    store.mark_synced(target, &versions)
                })
                .await;
                match marked {
                    Ok(count) => stamped = count,
                    Err(err) => {
                        self.log_batch(&ctx, target, batch_started, records.len(), Some(&outcome), Some(&err))
                            .await;
                        return Err(err);
                    }
                }
                let superseded = (versions.len() as u64).saturating_sub(stamped);
                if superseded > 0 {
                    info!(superseded, "rows changed while in flight stay pending");
                }
            }
            self.log_batch(&ctx, target, batch_started, records.len(), Some(&outcome), None)
                .await;

            report.synced += stamped;
            report.rejected.extend(outcome.rejected);
            report.anomalies.extend(outcome.anomalies);
        }
    }

    async fn log_batch(
        &self,
        ctx: &RunContext,
        target: SyncTarget,
        started_at: DateTime<Utc>,
        record_count: usize,
        outcome: Option<&BatchOutcome>,
        error: Option<&StoreError>,
    ) {
        let accepted = outcome.map(|o| o.accepted.len()).unwrap_or(0);
        let rejected = outcome
            .map(|o| o.rejected.len() + o.anomalies.len())
            .unwrap_or(0);
        let status = if error.is_some() {
            BatchStatus::Failed
        } else if accepted == record_count {
            BatchStatus::Completed
        } else {
            BatchStatus::Partial
        };
        let entry = SyncLogEntry {
            run_id: ctx.run_id,
            target,
            batch_no: ctx.batch_no,
            started_at,
            finished_at: Utc::now(),
            record_count: record_count as i32,
            accepted: accepted as i32,
            rejected: rejected as i32,
            status,
            error: error.map(ToString::to_string),
        };
        if let Err(err) = self.store.append_sync_log(&entry).await {
            warn!(batch_no = ctx.batch_no, error = %err, "could not append sync log entry");
        }
    }
}

/// Versions of the accepted rows exactly as they were read for this batch.
fn delivered_versions(records: &[Record], accepted: &[String]) -> Vec<SyncedVersion> {
    let accepted: HashSet<&str> = accepted.iter().map(String::as_str).collect();
    records
        .iter()
        .filter(|r| accepted.contains(r.unique_id.as_str()))
        .map(Record::synced_version)
        .collect()
}

enum Stop {
    Drained,
    Interrupted,
}
