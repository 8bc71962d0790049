use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use newsmirror_core::SyncTarget;
use newsmirror_storage::{
    Backend, MemoryStore, PgStore, RecordStore, StorageAdapter, StorageMode,
};
use newsmirror_sync::{
    maybe_build_scheduler, seed_from_file, AppConfig, BulkLoadOptions, BulkLoader,
    HttpEmbeddingProvider, IndexSyncJob, JobReport, MirrorExportJob, ParquetDirectoryMirror,
    TypesenseIndex,
};
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Shadow URL that selects the in-process backend.
const MEMORY_SHADOW: &str = "memory://";

#[derive(Debug, Parser)]
#[command(name = "newsmirror")]
#[command(about = "Keeps the news store, search index and open-data mirror in sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply schema migrations to the primary (and a Postgres shadow, if configured).
    Migrate,
    /// Upsert organizational units and topics from YAML files.
    Seed {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Push pending records to the search index.
    SyncIndex {
        #[arg(long)]
        batch_size: Option<usize>,
        /// Create the collection first when it is missing.
        #[arg(long)]
        ensure_collection: bool,
    },
    /// Append pending records to the parquet mirror.
    ExportMirror {
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Load a historical JSONL export into the primary store.
    BulkLoad {
        file: PathBuf,
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,
        #[arg(long)]
        max_records: Option<usize>,
        #[arg(long)]
        dry_run: bool,
        /// Leave secondary indexes in place during the load.
        #[arg(long)]
        keep_indexes: bool,
    },
    /// Re-copy organizational unit names onto records.
    Resync,
    /// Copy records whose shadow write failed from the primary into the shadow.
    RepairShadow,
    /// Show record counts, pending work and recent sync batches.
    Status {
        #[arg(long, default_value_t = 10)]
        log_limit: usize,
    },
    /// Run both jobs on their cron schedules until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing the current batch");
            shutdown_tx.send_replace(true);
        }
    });

    match run(cli.command, config, shutdown_rx).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

struct Stores {
    primary: Arc<PgStore>,
    shadow_pg: Option<Arc<PgStore>>,
    adapter: Arc<StorageAdapter>,
}

async fn connect(config: &AppConfig) -> Result<Stores> {
    let mode = config.storage_mode().context("invalid storage mode")?;
    let primary = Arc::new(
        PgStore::connect(&config.pool_config(&config.database_url))
            .await
            .context("connecting to primary store")?,
    );
    let mut shadow_pg = None;
    let shadow: Option<Arc<dyn RecordStore>> = match config.shadow_database_url.as_deref() {
        None => None,
        Some(MEMORY_SHADOW) => Some(memory_shadow(primary.as_ref(), mode).await?),
        Some(url) => {
            let store = Arc::new(
                PgStore::connect(&config.pool_config(url))
                    .await
                    .context("connecting to shadow store")?,
            );
            shadow_pg = Some(store.clone());
            Some(store)
        }
    };
    let adapter = StorageAdapter::new(primary.clone(), shadow, mode)
        .context("configuring storage adapter")?;
    Ok(Stores {
        primary,
        shadow_pg,
        adapter: Arc::new(adapter),
    })
}

/// An in-process shadow starts empty on every run, so it can take writes but never serve reads.
async fn memory_shadow(primary: &PgStore, mode: StorageMode) -> Result<Arc<dyn RecordStore>> {
    if mode.read_backend() == Backend::Shadow {
        bail!("STORAGE_READ_FROM=shadow needs a persistent shadow; {MEMORY_SHADOW} starts empty");
    }
    let shadow = MemoryStore::with_reference_of(primary)
        .await
        .context("seeding the memory shadow")?;
    Ok(Arc::new(shadow))
}

fn index_job(config: &AppConfig, stores: &Stores, batch_size: Option<usize>) -> Result<IndexSyncJob> {
    let http = config.http_client_config();
    let index = TypesenseIndex::new(
        &http,
        &config.typesense_url,
        &config.typesense_api_key,
        &config.typesense_collection,
    )
    .context("building search index client")?;
    let embedder = HttpEmbeddingProvider::new(
        &http,
        &config.embeddings_api_url,
        config.embeddings_api_key.clone(),
        config.embedding_dim,
    )
    .context("building embedding client")?;
    let mut settings = config.job_settings(SyncTarget::SearchIndex);
    if let Some(size) = batch_size {
        settings.batch_size = size.max(1);
    }
    Ok(IndexSyncJob::new(
        stores.adapter.clone(),
        Arc::new(index),
        Arc::new(embedder),
        settings,
        config.search_text_body_chars,
    ))
}

fn mirror_job(
    config: &AppConfig,
    stores: &Stores,
    batch_size: Option<usize>,
    dir: Option<PathBuf>,
) -> MirrorExportJob {
    let mut settings = config.job_settings(SyncTarget::Mirror);
    if let Some(size) = batch_size {
        settings.batch_size = size.max(1);
    }
    let publisher = ParquetDirectoryMirror::new(dir.unwrap_or_else(|| config.mirror_dir.clone()));
    MirrorExportJob::new(stores.adapter.clone(), Arc::new(publisher), settings)
}

fn print_report(report: &JobReport) {
    println!(
        "{} sync {:?}: run_id={} batches={} synced={} rejected={} anomalies={}",
        report.target,
        report.status,
        report.run_id,
        report.batches,
        report.synced,
        report.rejected.len(),
        report.anomaly_count()
    );
    for rejected in report.rejected.iter().chain(&report.anomalies).take(20) {
        println!("  excluded {}: {}", rejected.unique_id, rejected.reason);
    }
    if let Some(err) = &report.error {
        println!("  error: {err}");
    }
}

async fn run(command: Commands, config: AppConfig, shutdown: watch::Receiver<bool>) -> Result<u8> {
    let stores = connect(&config).await?;

    match command {
        Commands::Migrate => {
            stores.primary.migrate().await.context("migrating primary")?;
            if let Some(shadow) = &stores.shadow_pg {
                shadow.migrate().await.context("migrating shadow")?;
            }
            println!("migrations applied");
        }
        Commands::Seed { files } => {
            let (units, topics) = seed_from_file(stores.adapter.as_ref(), files.as_slice()).await?;
            println!("seeded units={units} topics={topics}");
        }
        Commands::SyncIndex {
            batch_size,
            ensure_collection,
        } => {
            let job = index_job(&config, &stores, batch_size)?;
            if ensure_collection {
                job.ensure_collection()
                    .await
                    .context("ensuring search collection")?;
            }
            let report = job.run(shutdown).await;
            print_report(&report);
            return Ok(report.status.exit_code());
        }
        Commands::ExportMirror { batch_size, dir } => {
            let report = mirror_job(&config, &stores, batch_size, dir).run(shutdown).await;
            print_report(&report);
            return Ok(report.status.exit_code());
        }
        Commands::BulkLoad {
            file,
            batch_size,
            max_records,
            dry_run,
            keep_indexes,
        } => {
            let options = BulkLoadOptions {
                batch_size,
                max_records,
                dry_run,
                relax_maintenance: !keep_indexes,
                backoff: config.backoff(),
            };
            let report = BulkLoader::new(stores.primary.as_ref(), options)
                .with_maintenance(stores.primary.as_ref())
                .load_file(&file)
                .await?;
            println!(
                "bulk load{}: read={} valid={} written={} already_present={} skipped={}",
                if report.dry_run { " (dry run)" } else { "" },
                report.rows_read,
                report.valid,
                report.written,
                report.already_present,
                report.skipped.len()
            );
            for row in report.skipped.iter().take(20) {
                println!(
                    "  line {} ({}): {}",
                    row.line,
                    row.unique_id.as_deref().unwrap_or("-"),
                    row.reason
                );
            }
        }
        Commands::Resync => {
            let touched = stores
                .adapter
                .resync_denormalized()
                .await
                .context("resyncing denormalized columns")?;
            println!("resynced records={touched}");
        }
        Commands::RepairShadow => {
            if !stores.adapter.mode().writes_shadow() {
                bail!("repair-shadow requires STORAGE_WRITE_MODE=dual-write");
            }
            let repaired = stores.adapter.repair_shadow().await?;
            println!("repaired records={repaired}");
        }
        Commands::Status { log_limit } => {
            let store = stores.adapter.as_ref();
            println!("storage mode: {}", stores.adapter.mode());
            println!("records: {}", store.count(&[]).await?);
            for target in SyncTarget::ALL {
                let pending = store.count_pending(target).await?;
                match store.sync_cursor(target).await? {
                    Some(cursor) => println!(
                        "{target}: pending={pending} watermark={} confirmed={}",
                        cursor.watermark.to_rfc3339(),
                        cursor.records_confirmed
                    ),
                    None => println!("{target}: pending={pending} never synced"),
                }
            }
            for entry in store.recent_sync_log(None, log_limit).await? {
                println!(
                    "  {} {} batch={} {} accepted={}/{}{}",
                    entry.started_at.to_rfc3339(),
                    entry.target,
                    entry.batch_no,
                    entry.status.as_str(),
                    entry.accepted,
                    entry.record_count,
                    entry
                        .error
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Schedule => {
            let index = Arc::new(index_job(&config, &stores, None)?);
            let mirror = Arc::new(mirror_job(&config, &stores, None, None));
            let Some(mut sched) = maybe_build_scheduler(&config, index, mirror, shutdown.clone()).await?
            else {
                bail!("scheduler disabled; set NEWSMIRROR_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            let mut shutdown = shutdown;
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            sched.shutdown().await.context("stopping scheduler")?;
            return Ok(newsmirror_sync::RunStatus::Interrupted.exit_code());
        }
    }
    Ok(0)
}
