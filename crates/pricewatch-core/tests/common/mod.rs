//! Shared harness for integration tests
//!
//! Every test gets its own freshly migrated database:
//!
//! - with `DATABASE_URL` set, a uniquely named database is created on that
//!   server (and left behind for inspection)
//! - with `PRICEWATCH_TESTCONTAINERS=1`, a throwaway Postgres container is
//!   started instead
//!
//! When neither is available [`TestDb::connect`] returns `None` and the test
//! returns early.

#![allow(dead_code)]

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, Connection, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;

use pricewatch_core::clock::{ManualClock, SharedClock};
use pricewatch_core::config::{Config, JobsConfig, MatchingConfig, ProxyConfig, WorkerConfig};
use pricewatch_core::db::MIGRATOR;
use pricewatch_core::ingest::{IngestionPipeline, StagingRecord};
use pricewatch_core::jobs::JobCoordinator;
use pricewatch_core::proxy::ProxyPool;

pub const SOURCE: &str = "greenspark";

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub struct TestDb {
    pub pool: PgPool,
    pub clock: Arc<ManualClock>,
    _container: Option<ContainerAsync<Postgres>>,
}

impl TestDb {
    /// Fresh database, or `None` when no Postgres is configured
    pub async fn connect() -> Option<Self> {
        pricewatch_common::logging::init_test_logging();

        let result = if let Ok(url) = std::env::var("DATABASE_URL") {
            Self::on_server(&url).await
        } else if std::env::var("PRICEWATCH_TESTCONTAINERS").as_deref() == Ok("1") {
            Self::in_container().await
        } else {
            println!("skipping: set DATABASE_URL or PRICEWATCH_TESTCONTAINERS=1");
            return None;
        };

        match result {
            Ok(db) => Some(db),
            Err(e) => panic!("test database setup failed: {:#}", e),
        }
    }

    async fn on_server(url: &str) -> Result<Self> {
        let admin = PgConnectOptions::from_str(url).context("invalid DATABASE_URL")?;
        let name = format!("pricewatch_test_{}", uuid::Uuid::new_v4().simple());

        let mut conn = admin.connect().await.context("connect to DATABASE_URL")?;
        sqlx::query(&format!("CREATE DATABASE {}", name))
            .execute(&mut conn)
            .await?;
        conn.close().await?;

        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect_with(admin.database(&name))
            .await?;
        Self::ready(pool, None).await
    }

    async fn in_container() -> Result<Self> {
        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432.tcp()).await?;
        let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(&url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Self::ready(pool, Some(container)).await
    }

    async fn ready(pool: PgPool, container: Option<ContainerAsync<Postgres>>) -> Result<Self> {
        MIGRATOR.run(&pool).await.context("Failed to run migrations")?;
        Ok(Self {
            pool,
            clock: Arc::new(ManualClock::new(epoch())),
            _container: container,
        })
    }

    pub fn shared_clock(&self) -> SharedClock {
        self.clock.clone()
    }

    pub fn coordinator(&self) -> JobCoordinator {
        self.coordinator_with(jobs_config())
    }

    pub fn coordinator_with(&self, config: JobsConfig) -> JobCoordinator {
        JobCoordinator::new(self.pool.clone(), self.shared_clock(), config)
    }

    pub fn proxies(&self) -> ProxyPool {
        ProxyPool::new(self.pool.clone(), self.shared_clock(), proxy_config())
    }

    pub fn pipeline(&self) -> IngestionPipeline {
        self.pipeline_with(MatchingConfig::default())
    }

    pub fn pipeline_with(&self, policy: MatchingConfig) -> IngestionPipeline {
        match IngestionPipeline::new(self.pool.clone(), self.shared_clock(), policy) {
            Ok(pipeline) => pipeline,
            Err(e) => panic!("pipeline construction failed: {}", e),
        }
    }
}

pub fn jobs_config() -> JobsConfig {
    Config::default().jobs
}

pub fn proxy_config() -> ProxyConfig {
    Config::default().proxy
}

/// Worker settings with millisecond backoff so retry paths run quickly
pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: None,
        idle_backoff_secs: 0,
        max_backoff_secs: 0,
        fetch_retries: 2,
        retry_base_ms: 1,
    }
}

/// A well-formed listing from [`SOURCE`]
pub fn listing(outlet: &str, name: &str, price: &str, quantity: &str, scraped_at: DateTime<Utc>) -> StagingRecord {
    let slug: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    StagingRecord::new(
        SOURCE,
        outlet,
        name,
        price,
        quantity,
        format!("https://greenspark.example/catalog/{}", slug),
        scraped_at,
    )
    .with_category(["Запчасти", "Дисплеи"])
}
