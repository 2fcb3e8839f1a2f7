//! Configuration management
//!
//! Loaded once per process from `.env` plus environment variables. The store
//! endpoint is chosen by deployment (local vs. cloud) and handed to every
//! component as an opaque `PgPool`.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{PipelineError, PipelineResult};

// ============================================================================
// Database Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/pricewatch";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Coordination Defaults
// ============================================================================

/// Attempts before a job is parked as permanently failed.
pub const DEFAULT_JOB_MAX_ATTEMPTS: i32 = 3;

/// Job lease length in seconds.
pub const DEFAULT_JOB_LEASE_SECS: i64 = 300;

/// Jobs claimed per `claim_batch` call.
pub const DEFAULT_JOB_BATCH_SIZE: i64 = 10;

/// Consecutive failures that turn a working proxy dead.
pub const DEFAULT_PROXY_FAILURE_THRESHOLD: i32 = 3;

/// Seconds after which a checked proxy is due for re-check.
pub const DEFAULT_PROXY_RECHECK_SECS: i64 = 3600;

/// Health-check lease length in seconds.
pub const DEFAULT_PROXY_LEASE_SECS: i64 = 30;

/// Distinct source bans that retire a proxy.
pub const DEFAULT_PROXY_BAN_LIMIT: i32 = 3;

/// URL fetched through a proxy to decide whether it works.
pub const DEFAULT_PROXY_PROBE_URL: &str = "https://www.google.com/generate_204";

/// Timeout for one proxy probe in seconds.
pub const DEFAULT_PROXY_PROBE_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Matching Defaults
// ============================================================================

/// Score at or above which a name match is merged automatically.
pub const DEFAULT_MATCH_ACCEPT_THRESHOLD: f64 = 0.92;

/// Score below which the record is treated as a new product.
pub const DEFAULT_MATCH_REVIEW_FLOOR: f64 = 0.75;

/// Minimum lead of the best candidate over the runner-up.
pub const DEFAULT_MATCH_TIE_MARGIN: f64 = 0.05;

/// Maximum candidates scored per record.
pub const DEFAULT_MATCH_CANDIDATE_LIMIT: i64 = 500;

// ============================================================================
// Worker Defaults
// ============================================================================

pub const DEFAULT_WORKER_IDLE_BACKOFF_SECS: u64 = 5;
pub const DEFAULT_WORKER_MAX_BACKOFF_SECS: u64 = 300;
pub const DEFAULT_WORKER_FETCH_RETRIES: u32 = 3;

/// First delay of the transient-fetch backoff, doubled per retry
pub const DEFAULT_WORKER_RETRY_BASE_MS: u64 = 500;

/// Pricewatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub deployment: Deployment,
    pub database: DatabaseConfig,
    pub jobs: JobsConfig,
    pub proxy: ProxyConfig,
    pub matching: MatchingConfig,
    pub worker: WorkerConfig,
}

/// Which store the process talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    #[default]
    Local,
    Cloud,
}

impl FromStr for Deployment {
    type Err = PipelineError;

    fn from_str(s: &str) -> PipelineResult<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Deployment::Local),
            "cloud" | "remote" => Ok(Deployment::Cloud),
            other => Err(PipelineError::Config(format!("Unknown deployment: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub max_attempts: i32,
    pub lease_secs: i64,
    pub batch_size: i64,
}

impl JobsConfig {
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub failure_threshold: i32,
    pub recheck_secs: i64,
    pub lease_secs: i64,
    pub ban_limit: i32,
    pub probe_url: String,
    pub probe_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs)
    }

    pub fn recheck_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recheck_secs)
    }
}

/// Name-matching policy; see [`crate::ingest::matcher`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub accept_threshold: f64,
    pub review_floor: f64,
    pub tie_margin: f64,
    pub candidate_limit: i64,
    /// Extra boilerplate tokens stripped during normalisation
    pub extra_boilerplate: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: Option<String>,
    pub idle_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub fetch_retries: u32,
    pub retry_base_ms: u64,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|s| {
            s.split(',')
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    /// Load configuration from `.env`, environment and defaults
    pub fn load() -> PipelineResult<Self> {
        dotenvy::dotenv().ok();

        let deployment = match std::env::var("PRICEWATCH_DEPLOYMENT") {
            Ok(value) => value.parse()?,
            Err(_) => Deployment::Local,
        };

        let url = match deployment {
            Deployment::Local => std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            Deployment::Cloud => std::env::var("CLOUD_DATABASE_URL").map_err(|_| {
                PipelineError::Config(
                    "CLOUD_DATABASE_URL must be set when PRICEWATCH_DEPLOYMENT=cloud".to_string(),
                )
            })?,
        };

        let defaults = Config::default();
        let config = Config {
            deployment,
            database: DatabaseConfig {
                url,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS")
                    .unwrap_or(DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT")
                    .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
                idle_timeout_secs: env_parse("DATABASE_IDLE_TIMEOUT")
                    .unwrap_or(DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            jobs: JobsConfig {
                max_attempts: env_parse("JOB_MAX_ATTEMPTS").unwrap_or(defaults.jobs.max_attempts),
                lease_secs: env_parse("JOB_LEASE_SECS").unwrap_or(defaults.jobs.lease_secs),
                batch_size: env_parse("JOB_BATCH_SIZE").unwrap_or(defaults.jobs.batch_size),
            },
            proxy: ProxyConfig {
                failure_threshold: env_parse("PROXY_FAILURE_THRESHOLD")
                    .unwrap_or(defaults.proxy.failure_threshold),
                recheck_secs: env_parse("PROXY_RECHECK_SECS").unwrap_or(defaults.proxy.recheck_secs),
                lease_secs: env_parse("PROXY_LEASE_SECS").unwrap_or(defaults.proxy.lease_secs),
                ban_limit: env_parse("PROXY_BAN_LIMIT").unwrap_or(defaults.proxy.ban_limit),
                probe_url: std::env::var("PROXY_PROBE_URL").unwrap_or(defaults.proxy.probe_url),
                probe_timeout_secs: env_parse("PROXY_PROBE_TIMEOUT")
                    .unwrap_or(defaults.proxy.probe_timeout_secs),
            },
            matching: MatchingConfig {
                accept_threshold: env_parse("MATCH_ACCEPT_THRESHOLD")
                    .unwrap_or(defaults.matching.accept_threshold),
                review_floor: env_parse("MATCH_REVIEW_FLOOR")
                    .unwrap_or(defaults.matching.review_floor),
                tie_margin: env_parse("MATCH_TIE_MARGIN").unwrap_or(defaults.matching.tie_margin),
                candidate_limit: env_parse("MATCH_CANDIDATE_LIMIT")
                    .unwrap_or(defaults.matching.candidate_limit),
                extra_boilerplate: env_list("MATCH_EXTRA_BOILERPLATE"),
            },
            worker: WorkerConfig {
                worker_id: std::env::var("WORKER_ID").ok().filter(|s| !s.trim().is_empty()),
                idle_backoff_secs: env_parse("WORKER_IDLE_BACKOFF_SECS")
                    .unwrap_or(defaults.worker.idle_backoff_secs),
                max_backoff_secs: env_parse("WORKER_MAX_BACKOFF_SECS")
                    .unwrap_or(defaults.worker.max_backoff_secs),
                fetch_retries: env_parse("WORKER_FETCH_RETRIES")
                    .unwrap_or(defaults.worker.fetch_retries),
                retry_base_ms: env_parse("WORKER_RETRY_BASE_MS")
                    .unwrap_or(defaults.worker.retry_base_ms),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> PipelineResult<()> {
        let fail = |msg: String| Err(PipelineError::Config(msg));

        if self.database.url.is_empty() {
            return fail("Database URL cannot be empty".to_string());
        }
        if self.deployment == Deployment::Cloud && !self.database.url.contains("sslmode=require") {
            return fail("Cloud database URL must use sslmode=require".to_string());
        }
        if self.database.max_connections == 0 {
            return fail("Database max_connections must be greater than 0".to_string());
        }
        if self.database.min_connections > self.database.max_connections {
            return fail(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            ));
        }
        if self.jobs.max_attempts < 1 {
            return fail("JOB_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if self.jobs.lease_secs <= 0 || self.proxy.lease_secs <= 0 {
            return fail("Lease durations must be positive".to_string());
        }
        if self.jobs.batch_size <= 0 {
            return fail("JOB_BATCH_SIZE must be positive".to_string());
        }
        if self.proxy.failure_threshold < 1 {
            return fail("PROXY_FAILURE_THRESHOLD must be at least 1".to_string());
        }

        let m = &self.matching;
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(m.accept_threshold) || !in_unit(m.review_floor) || !in_unit(m.tie_margin) {
            return fail("Matching thresholds must lie in [0, 1]".to_string());
        }
        if m.review_floor > m.accept_threshold {
            return fail(format!(
                "MATCH_REVIEW_FLOOR ({}) cannot exceed MATCH_ACCEPT_THRESHOLD ({})",
                m.review_floor, m.accept_threshold
            ));
        }
        if m.candidate_limit <= 0 {
            return fail("MATCH_CANDIDATE_LIMIT must be positive".to_string());
        }
        if self.worker.max_backoff_secs < self.worker.idle_backoff_secs {
            tracing::warn!(
                idle = self.worker.idle_backoff_secs,
                max = self.worker.max_backoff_secs,
                "Worker max backoff below idle backoff; idle backoff wins"
            );
        }

        Ok(())
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            accept_threshold: DEFAULT_MATCH_ACCEPT_THRESHOLD,
            review_floor: DEFAULT_MATCH_REVIEW_FLOOR,
            tie_margin: DEFAULT_MATCH_TIE_MARGIN,
            candidate_limit: DEFAULT_MATCH_CANDIDATE_LIMIT,
            extra_boilerplate: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deployment: Deployment::Local,
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            jobs: JobsConfig {
                max_attempts: DEFAULT_JOB_MAX_ATTEMPTS,
                lease_secs: DEFAULT_JOB_LEASE_SECS,
                batch_size: DEFAULT_JOB_BATCH_SIZE,
            },
            proxy: ProxyConfig {
                failure_threshold: DEFAULT_PROXY_FAILURE_THRESHOLD,
                recheck_secs: DEFAULT_PROXY_RECHECK_SECS,
                lease_secs: DEFAULT_PROXY_LEASE_SECS,
                ban_limit: DEFAULT_PROXY_BAN_LIMIT,
                probe_url: DEFAULT_PROXY_PROBE_URL.to_string(),
                probe_timeout_secs: DEFAULT_PROXY_PROBE_TIMEOUT_SECS,
            },
            matching: MatchingConfig::default(),
            worker: WorkerConfig {
                worker_id: None,
                idle_backoff_secs: DEFAULT_WORKER_IDLE_BACKOFF_SECS,
                max_backoff_secs: DEFAULT_WORKER_MAX_BACKOFF_SECS,
                fetch_retries: DEFAULT_WORKER_FETCH_RETRIES,
                retry_base_ms: DEFAULT_WORKER_RETRY_BASE_MS,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.jobs.max_attempts, DEFAULT_JOB_MAX_ATTEMPTS);
    }

    #[test]
    fn test_review_floor_above_accept_rejected() {
        let mut config = Config::default();
        config.matching.review_floor = 0.95;
        config.matching.accept_threshold = 0.9;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_cloud_requires_tls() {
        let mut config = Config::default();
        config.deployment = Deployment::Cloud;
        config.database.url = "postgresql://db.example.com/pricewatch".to_string();
        assert!(config.validate().is_err());

        config.database.url.push_str("?sslmode=require");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_bounds_checked() {
        let mut config = Config::default();
        config.database.min_connections = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deployment_from_str() {
        assert_eq!("Cloud".parse::<Deployment>().unwrap(), Deployment::Cloud);
        assert_eq!("local".parse::<Deployment>().unwrap(), Deployment::Local);
        assert!("moon".parse::<Deployment>().is_err());
    }
}
