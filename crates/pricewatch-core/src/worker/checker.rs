//! Proxy health checker
//!
//! Two ways to drive checks: straight off the proxy table
//! ([`ProxyChecker::check_once`], using the pool's own check leases), or
//! from `proxy_check` jobs on the coordinator ([`ProxyChecker::process_check_jobs`])
//! when checks are fanned out across servers.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::backoff;
use crate::config::{ProxyConfig, WorkerConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::jobs::{Job, JobCoordinator, JobKind};
use crate::proxy::{ProxyPool, ProxyRecord, ProxyStatus};
use crate::WorkerId;

/// Payload key naming the endpoint of a `proxy_check` job
pub const ENDPOINT_KEY: &str = "endpoint";

/// Reachability test for one endpoint
#[async_trait]
pub trait ProxyProbe: Send + Sync {
    async fn probe(&self, proxy: &ProxyRecord) -> bool;
}

/// GET a known URL through the proxy and expect a 2xx
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            config.probe_url.clone(),
            Duration::from_secs(config.probe_timeout_secs),
        )
    }

    async fn try_probe(&self, proxy: &ProxyRecord) -> reqwest::Result<bool> {
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy.url())?)
            .timeout(self.timeout)
            .build()?;
        let response = client.get(&self.url).send().await?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl ProxyProbe for HttpProbe {
    async fn probe(&self, proxy: &ProxyRecord) -> bool {
        match self.try_probe(proxy).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(endpoint = %proxy.endpoint, error = %e, "Probe failed");
                false
            }
        }
    }
}

/// Outcome counts of one checking pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    pub checked: u64,
    pub working: u64,
    pub dead: u64,
}

impl CheckSummary {
    fn add(&mut self, status: ProxyStatus) {
        self.checked += 1;
        match status {
            ProxyStatus::Working => self.working += 1,
            ProxyStatus::Dead => self.dead += 1,
            ProxyStatus::Unchecked => {}
        }
    }

    fn merge(&mut self, other: CheckSummary) {
        self.checked += other.checked;
        self.working += other.working;
        self.dead += other.dead;
    }
}

pub struct ProxyChecker {
    id: WorkerId,
    pool: ProxyPool,
    probe: Arc<dyn ProxyProbe>,
    config: ProxyConfig,
    worker: WorkerConfig,
    batch_size: i64,
}

impl ProxyChecker {
    pub fn new(
        id: WorkerId,
        pool: ProxyPool,
        probe: Arc<dyn ProxyProbe>,
        config: ProxyConfig,
        worker: WorkerConfig,
        batch_size: i64,
    ) -> Self {
        Self {
            id,
            pool,
            probe,
            config,
            worker,
            batch_size,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Lease one batch of due proxies, probe them concurrently, report back
    #[tracing::instrument(skip(self), fields(checker_id = %self.id))]
    pub async fn check_once(&self) -> PipelineResult<CheckSummary> {
        let batch = self
            .pool
            .check_batch(&self.id, self.batch_size, self.config.lease())
            .await?;
        if batch.is_empty() {
            return Ok(CheckSummary::default());
        }

        let results = join_all(batch.iter().map(|proxy| self.probe.probe(proxy))).await;

        let mut summary = CheckSummary::default();
        for (proxy, ok) in batch.iter().zip(results) {
            summary.add(self.pool.report_check(&proxy.endpoint, &self.id, ok).await?);
        }

        tracing::info!(
            checked = summary.checked,
            working = summary.working,
            dead = summary.dead,
            "Proxy batch checked"
        );
        Ok(summary)
    }

    /// Check until nothing is due
    pub async fn run_until_idle(&self) -> PipelineResult<CheckSummary> {
        let mut total = CheckSummary::default();
        loop {
            let pass = self.check_once().await?;
            if pass.checked == 0 {
                return Ok(total);
            }
            total.merge(pass);
        }
    }

    /// Keep checking until `shutdown` flips to true, backing off while idle
    pub async fn watch(&self, mut shutdown: watch::Receiver<bool>) -> PipelineResult<CheckSummary> {
        let mut total = CheckSummary::default();
        let mut idle_rounds = 0u32;
        while !*shutdown.borrow() {
            let pass = self.check_once().await?;
            if pass.checked > 0 {
                idle_rounds = 0;
                total.merge(pass);
                continue;
            }

            idle_rounds += 1;
            let delay = backoff::jittered(backoff::exponential(
                idle_rounds - 1,
                Duration::from_secs(self.worker.idle_backoff_secs),
                Duration::from_secs(self.worker.max_backoff_secs),
            ));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(checked = total.checked, "Proxy checker stopped");
        Ok(total)
    }

    /// Drain `proxy_check` jobs from the coordinator
    ///
    /// Each job names one endpoint. Unknown endpoints fail the job; every
    /// other job is completed with the status the probe produced.
    #[tracing::instrument(skip(self, coordinator), fields(checker_id = %self.id))]
    pub async fn process_check_jobs(&self, coordinator: &JobCoordinator) -> PipelineResult<CheckSummary> {
        let lease = coordinator.config().lease();
        let mut total = CheckSummary::default();
        loop {
            let jobs = coordinator
                .claim_batch(JobKind::ProxyCheck, &self.id, self.batch_size, lease)
                .await?;
            if jobs.is_empty() {
                return Ok(total);
            }

            let mut targets = Vec::with_capacity(jobs.len());
            for job in jobs {
                match self.lookup(&job).await? {
                    Some(proxy) => targets.push((job, proxy)),
                    None => {
                        let endpoint = job.payload.get(ENDPOINT_KEY).cloned();
                        tracing::warn!(job_id = %job.id, ?endpoint, "Check job names no known proxy");
                        coordinator
                            .fail(job.id, &self.id, "unknown proxy endpoint")
                            .await?;
                    }
                }
            }

            let results = join_all(targets.iter().map(|(_, proxy)| self.probe.probe(proxy))).await;

            for ((job, proxy), ok) in targets.iter().zip(results) {
                let status = self.pool.report_check(&proxy.endpoint, &self.id, ok).await?;
                total.add(status);
                let result = json!({ "endpoint": proxy.endpoint, "status": status.as_str() });
                match coordinator.complete(job.id, &self.id, result).await {
                    Ok(()) => {}
                    Err(PipelineError::LeaseConflict { .. }) => {
                        tracing::warn!(job_id = %job.id, "Check job reclaimed before completion");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    async fn lookup(&self, job: &Job) -> PipelineResult<Option<ProxyRecord>> {
        match job.payload.get(ENDPOINT_KEY).and_then(|v| v.as_str()) {
            Some(endpoint) => self.pool.get(endpoint).await,
            None => Ok(None),
        }
    }
}
