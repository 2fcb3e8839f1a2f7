//! Pricewatch Core
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Crawl coordination and price ingestion for a fleet of independent scrapers.
//!
//! # Overview
//!
//! Every component is backed by one shared PostgreSQL database, which is the
//! only authority on who owns what:
//!
//! - **[`jobs::JobCoordinator`]**: lease-based work claiming over the `jobs`
//!   table (`FOR UPDATE SKIP LOCKED`), retries, parking and relay hand-off
//! - **[`proxy::ProxyPool`]**: egress endpoints, health checks and per-source bans
//! - **[`ingest::IngestionStage`]**: append-only staging plus resolution of raw
//!   listings to canonical nomenclature, with a review queue for anything
//!   that cannot be matched confidently
//! - **[`ledger::PriceLedger`]**: current price snapshot per (product, outlet)
//!   and an immutable change history
//!
//! Source adapters (HTTP fetching, parsing, pagination) live outside this
//! crate and plug in through [`adapter::SourceAdapter`]; [`worker`] drives
//! them against the components above.
//!
//! # Example
//!
//! ```no_run
//! use pricewatch_core::{clock::SystemClock, config::Config, db, ingest::IngestionPipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     db::run_migrations(&pool).await?;
//!     let pipeline = IngestionPipeline::new(pool, Arc::new(SystemClock), config.matching)?;
//!     # let _ = pipeline;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod ledger;
pub mod proxy;
pub mod worker;

// Re-export commonly used types
pub use error::{PipelineError, PipelineResult};
pub use pricewatch_common::WorkerId;
