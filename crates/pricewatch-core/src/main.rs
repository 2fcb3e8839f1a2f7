//! Pricewatch Worker - operator entry point

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use pricewatch_common::logging::{init_logging, LogConfig, LogLevel};
use pricewatch_common::WorkerId;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use pricewatch_core::clock::{SharedClock, SystemClock};
use pricewatch_core::config::Config;
use pricewatch_core::db;
use pricewatch_core::ingest::{IngestionPipeline, ReviewDecision};
use pricewatch_core::jobs::{JobCoordinator, JobKind};
use pricewatch_core::ledger::PriceLedger;
use pricewatch_core::proxy::ProxyPool;
use pricewatch_core::worker::{HttpProbe, ProxyChecker};

#[derive(Parser)]
#[command(name = "pricewatch-worker", version, about = "Crawl coordination and price ingestion")]
struct Cli {
    /// Debug logging to the console
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,

    /// Probe proxies that are unchecked or due for a re-check
    CheckProxies {
        /// Keep checking until interrupted
        #[arg(long)]
        watch: bool,

        /// Work `proxy_check` jobs from the queue instead of the proxy table
        #[arg(long, conflicts_with = "watch")]
        from_jobs: bool,

        /// Proxies per batch
        #[arg(long, default_value_t = 10)]
        batch_size: i64,
    },

    /// Import proxy endpoints from a file, one per line
    ImportProxies { file: PathBuf },

    /// Job and proxy counts; exits non-zero when parked jobs exist
    Stats {
        /// Only count jobs of this source
        #[arg(long)]
        source: Option<String>,
    },

    /// Zero quantity on listings of a source not seen since a run start
    MarkStale {
        #[arg(long)]
        source: String,

        /// Run start time (RFC 3339)
        #[arg(long)]
        since: DateTime<Utc>,
    },

    /// Return a parked job to the queue with a fresh retry budget
    Requeue { job_id: Uuid },

    /// List pending review items
    Reviews {
        #[arg(long)]
        source: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Settle a review item
    ResolveReview {
        review_id: i64,

        /// Merge into an existing nomenclature entity
        #[arg(long, group = "decision")]
        use_existing: Option<i64>,

        /// Treat the listing as a new product
        #[arg(long, group = "decision")]
        create_new: bool,

        /// Drop the item
        #[arg(long, group = "decision")]
        dismiss: bool,

        #[arg(long, env = "USER", default_value = "operator")]
        reviewed_by: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let defaults = if cli.verbose {
        LogConfig::builder()
            .level(LogLevel::Debug)
            .log_file_prefix("pricewatch-worker")
            .filter_directives("pricewatch_core=debug,sqlx=warn")
            .build()
    } else {
        LogConfig::builder()
            .log_file_prefix("pricewatch-worker")
            .filter_directives("pricewatch_core=info,sqlx=warn")
            .build()
    };

    // Environment variables take precedence
    let log_config = defaults.clone().merge_env().unwrap_or(defaults);
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {}", e);
            None
        }
    };

    let code = match execute(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // Flush the file appender before exiting
    drop(guard);
    process::exit(code);
}

/// Run one subcommand and return the process exit code
async fn execute(command: Command) -> Result<i32> {
    let config = Config::load().context("Failed to load configuration")?;
    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    info!(deployment = ?config.deployment, "Database connection pool established");

    let clock: SharedClock = Arc::new(SystemClock);
    let worker_id = match &config.worker.worker_id {
        Some(id) => WorkerId::new(id.clone())?,
        None => WorkerId::from_host("worker"),
    };

    match command {
        Command::Migrate => {
            db::run_migrations(&pool).await?;
            info!("Database migrations completed");
        }

        Command::CheckProxies {
            watch: keep_watching,
            from_jobs,
            batch_size,
        } => {
            let proxies = ProxyPool::new(pool.clone(), clock.clone(), config.proxy.clone());
            let checker = ProxyChecker::new(
                worker_id,
                proxies,
                Arc::new(HttpProbe::from_config(&config.proxy)),
                config.proxy.clone(),
                config.worker.clone(),
                batch_size,
            );

            let summary = if from_jobs {
                let coordinator = JobCoordinator::new(pool.clone(), clock.clone(), config.jobs.clone());
                checker.process_check_jobs(&coordinator).await?
            } else if keep_watching {
                let (tx, rx) = watch::channel(false);
                tokio::spawn(async move {
                    if signal::ctrl_c().await.is_ok() {
                        info!("Shutdown requested");
                        let _ = tx.send(true);
                    }
                });
                checker.watch(rx).await?
            } else {
                checker.run_until_idle().await?
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::ImportProxies { file } => {
            let contents = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let proxies = ProxyPool::new(pool.clone(), clock.clone(), config.proxy.clone());
            let summary = proxies.import(contents.lines()).await?;
            println!(
                "inserted: {}, already known: {}, invalid: {}",
                summary.inserted, summary.already_known, summary.invalid
            );
        }

        Command::Stats { source } => {
            let mut coordinator = JobCoordinator::new(pool.clone(), clock.clone(), config.jobs.clone());
            if let Some(source) = source {
                coordinator = coordinator.for_source(source);
            }
            let proxies = ProxyPool::new(pool.clone(), clock.clone(), config.proxy.clone());

            let mut parked = 0;
            for kind in JobKind::ALL {
                let stats = coordinator.stats(kind).await?;
                println!(
                    "{:<15} pending={} claimed={} done={} failed={}",
                    kind.as_str(),
                    stats.pending,
                    stats.claimed,
                    stats.done,
                    stats.failed
                );
                parked += stats.failed;
            }
            let proxy_stats = proxies.stats().await?;
            println!(
                "{:<15} unchecked={} working={} dead={}",
                "proxies", proxy_stats.unchecked, proxy_stats.working, proxy_stats.dead
            );

            if parked > 0 {
                return Ok(2);
            }
        }

        Command::MarkStale { source, since } => {
            let ledger = PriceLedger::new(pool.clone(), clock.clone());
            let marked = ledger.mark_stale(&source, since).await?;
            println!("marked {} listings stale", marked);
        }

        Command::Requeue { job_id } => {
            let coordinator = JobCoordinator::new(pool.clone(), clock.clone(), config.jobs.clone());
            if !coordinator.requeue_parked(job_id).await? {
                eprintln!("Job {} is not parked or a live duplicate exists", job_id);
                return Ok(1);
            }
            println!("requeued {}", job_id);
        }

        Command::Reviews { source, limit } => {
            let pipeline = IngestionPipeline::new(pool.clone(), clock.clone(), config.matching.clone())?;
            let items = pipeline.stage().pending_reviews(source.as_deref(), limit).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }

        Command::ResolveReview {
            review_id,
            use_existing,
            create_new,
            dismiss,
            reviewed_by,
        } => {
            let decision = match (use_existing, create_new, dismiss) {
                (Some(id), false, false) => ReviewDecision::UseExisting(id),
                (None, true, false) => ReviewDecision::CreateNew,
                (None, false, true) => ReviewDecision::Dismiss,
                _ => anyhow::bail!("Pass exactly one of --use-existing, --create-new or --dismiss"),
            };
            let pipeline = IngestionPipeline::new(pool.clone(), clock.clone(), config.matching.clone())?;
            match pipeline.resolve_review(review_id, decision, &reviewed_by).await? {
                Some((observation, outcome)) => println!(
                    "review {} resolved to nomenclature {}: {:?}",
                    review_id, observation.entity.id, outcome
                ),
                None => println!("review {} dismissed", review_id),
            }
        }
    }

    Ok(0)
}
