//! Crawl worker
//!
//! Drives one [`SourceAdapter`] against the coordinator, the proxy pool and
//! the ingestion pipeline. A worker owns at most one batch at a time and
//! walks each job page by page, checkpointing the cursor into the job
//! payload so a reclaiming worker resumes where this one stopped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::backoff;
use crate::adapter::{AdapterError, Page, SourceAdapter};
use crate::clock::SharedClock;
use crate::config::WorkerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::ingest::{IngestOutcome, IngestionPipeline, PipelineOutcome};
use crate::jobs::{FailOutcome, Job, JobCoordinator, JobKind};
use crate::proxy::{ProxyPool, ProxyRecord};
use crate::WorkerId;

/// Payload key holding the resume cursor
pub const CURSOR_KEY: &str = "cursor";
/// Payload key holding the number of pages already ingested
pub const PAGES_DONE_KEY: &str = "pages_done";

/// Tally of one crawl run
#[derive(Debug, Clone, Serialize)]
pub struct CrawlRun {
    pub source_id: String,
    pub run_started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_parked: u64,
    pub jobs_relayed: u64,
    pub jobs_released: u64,
    pub leases_lost: u64,
    pub pages: u64,
    pub records_applied: u64,
    pub price_changes: u64,
    pub flagged_ambiguous: u64,
    pub flagged_malformed: u64,
    pub stale_marked: u64,
}

impl CrawlRun {
    fn start(source_id: &str, run_started_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.to_string(),
            run_started_at,
            finished_at: None,
            jobs_completed: 0,
            jobs_retried: 0,
            jobs_parked: 0,
            jobs_relayed: 0,
            jobs_released: 0,
            leases_lost: 0,
            pages: 0,
            records_applied: 0,
            price_changes: 0,
            flagged_ambiguous: 0,
            flagged_malformed: 0,
            stale_marked: 0,
        }
    }

    /// Process exit status: non-zero when any job ran out of attempts
    pub fn exit_code(&self) -> i32 {
        if self.jobs_parked > 0 {
            1
        } else {
            0
        }
    }

    fn record(&mut self, outcome: &PipelineOutcome) {
        match outcome {
            PipelineOutcome::Applied { outcome, .. } => {
                self.records_applied += 1;
                if outcome.wrote_history() {
                    self.price_changes += 1;
                }
            }
            PipelineOutcome::Flagged(IngestOutcome::Ambiguous { .. }) => self.flagged_ambiguous += 1,
            PipelineOutcome::Flagged(IngestOutcome::Malformed { .. }) => self.flagged_malformed += 1,
            PipelineOutcome::Flagged(IngestOutcome::Resolved { .. }) => {}
        }
    }

    fn record_job(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.jobs_completed += 1,
            JobOutcome::Failed(FailOutcome::Retrying { .. }) => self.jobs_retried += 1,
            JobOutcome::Failed(FailOutcome::Parked { .. }) => self.jobs_parked += 1,
            JobOutcome::Relayed => self.jobs_relayed += 1,
            JobOutcome::Released => self.jobs_released += 1,
            JobOutcome::LeaseLost => self.leases_lost += 1,
        }
    }
}

/// What one `run_once` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing claimable for any configured kind
    Idle,
    /// No working proxy for this source; nothing was claimed
    NoProxies,
    Processed(usize),
}

/// How a single claimed job left the worker's hands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Failed(FailOutcome),
    Relayed,
    /// Returned to the queue without spending an attempt
    Released,
    /// Another worker reclaimed the job after our lease expired
    LeaseLost,
}

/// Why fetching a page gave up
#[derive(Debug)]
enum FetchFailure {
    Blocked(String),
    Exhausted(String),
    Fatal(String),
    NoProxies,
    /// The job's lease went to another worker between fetches
    LeaseLost,
    Pipeline(PipelineError),
}

impl From<PipelineError> for FetchFailure {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NoHealthyProxies => FetchFailure::NoProxies,
            PipelineError::LeaseConflict { .. } => FetchFailure::LeaseLost,
            other => FetchFailure::Pipeline(other),
        }
    }
}

pub struct CrawlWorker {
    id: WorkerId,
    clock: SharedClock,
    coordinator: JobCoordinator,
    proxies: ProxyPool,
    pipeline: IngestionPipeline,
    adapter: Arc<dyn SourceAdapter>,
    config: WorkerConfig,
    kinds: Vec<JobKind>,
    relay_to: Option<WorkerId>,
}

impl CrawlWorker {
    /// The coordinator is scoped to the adapter's source, so this worker
    /// never claims or counts another source's jobs
    pub fn new(
        id: WorkerId,
        clock: SharedClock,
        coordinator: JobCoordinator,
        proxies: ProxyPool,
        pipeline: IngestionPipeline,
        adapter: Arc<dyn SourceAdapter>,
        config: WorkerConfig,
    ) -> Self {
        let coordinator = coordinator.for_source(adapter.source_id());
        Self {
            id,
            clock,
            coordinator,
            proxies,
            pipeline,
            adapter,
            config,
            kinds: vec![JobKind::CrawlCategory, JobKind::CrawlPage],
            relay_to: None,
        }
    }

    /// Job kinds to claim, in priority order
    pub fn with_kinds(mut self, kinds: Vec<JobKind>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Hand blocked jobs to this peer instead of rotating proxies locally
    pub fn with_relay_target(mut self, peer: WorkerId) -> Self {
        self.relay_to = Some(peer);
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn source_id(&self) -> &str {
        self.adapter.source_id()
    }

    /// Claim and work through one batch
    #[tracing::instrument(skip(self, run), fields(worker_id = %self.id, source_id = self.adapter.source_id()))]
    pub async fn run_once(&self, run: &mut CrawlRun) -> PipelineResult<BatchOutcome> {
        let batch_size = self.coordinator.config().batch_size;

        // Proxies first: claiming without egress would only burn leases
        let proxies = if self.adapter.needs_proxy() {
            match self.proxies.acquire_working_for(self.source_id(), batch_size).await {
                Ok(proxies) => proxies,
                Err(PipelineError::NoHealthyProxies) => return Ok(BatchOutcome::NoProxies),
                Err(e) => return Err(e),
            }
        } else {
            Vec::new()
        };

        let lease = self.coordinator.config().lease();
        let mut jobs = Vec::new();
        for kind in &self.kinds {
            // Relayed to us first, then fresh claims
            jobs = self.coordinator.owned(*kind, &self.id, batch_size).await?;
            if jobs.is_empty() {
                jobs = self.coordinator.claim_batch(*kind, &self.id, batch_size, lease).await?;
            }
            if !jobs.is_empty() {
                break;
            }
        }
        if jobs.is_empty() {
            return Ok(BatchOutcome::Idle);
        }

        let claimed = jobs.len();
        for (i, job) in jobs.into_iter().enumerate() {
            let proxy = if proxies.is_empty() {
                None
            } else {
                proxies.get(i % proxies.len()).cloned()
            };
            let outcome = self.process_job(job, proxy, run).await?;
            run.record_job(outcome);
        }

        Ok(BatchOutcome::Processed(claimed))
    }

    /// Keep claiming until the queue has nothing left for this worker
    ///
    /// Waiting on an empty proxy pool is bounded by `fetch_retries` rounds of
    /// backoff; the run then ends with whatever was processed.
    pub async fn run_until_drained(&self) -> PipelineResult<CrawlRun> {
        let mut run = CrawlRun::start(self.source_id(), self.clock.now());
        self.drain(&mut run).await?;
        run.finished_at = Some(self.clock.now());
        Ok(run)
    }

    /// Drain the queue, then zero listings this run did not see
    ///
    /// Staleness is only marked when the run parked nothing and no job of
    /// this source is still pending or claimed elsewhere; otherwise
    /// unseen listings may simply belong to pages nobody fetched.
    #[tracing::instrument(skip(self), fields(worker_id = %self.id, source_id = self.adapter.source_id()))]
    pub async fn full_run(&self) -> PipelineResult<CrawlRun> {
        let mut run = CrawlRun::start(self.source_id(), self.clock.now());
        self.drain(&mut run).await?;

        let mut drained = run.jobs_parked == 0;
        for kind in &self.kinds {
            if !self.coordinator.stats(*kind).await?.is_drained() {
                drained = false;
            }
        }

        if drained {
            run.stale_marked = self
                .pipeline
                .ledger()
                .mark_stale(self.source_id(), run.run_started_at)
                .await?;
        } else {
            tracing::warn!(
                jobs_parked = run.jobs_parked,
                "Run incomplete; skipping stale marking"
            );
        }

        run.finished_at = Some(self.clock.now());
        tracing::info!(
            jobs_completed = run.jobs_completed,
            jobs_parked = run.jobs_parked,
            records_applied = run.records_applied,
            stale_marked = run.stale_marked,
            "Crawl run finished"
        );
        Ok(run)
    }

    async fn drain(&self, run: &mut CrawlRun) -> PipelineResult<()> {
        let mut proxy_waits = 0u32;
        loop {
            match self.run_once(run).await? {
                BatchOutcome::Processed(_) => proxy_waits = 0,
                BatchOutcome::Idle => return Ok(()),
                BatchOutcome::NoProxies => {
                    proxy_waits += 1;
                    if proxy_waits > self.config.fetch_retries {
                        tracing::warn!(source_id = self.source_id(), "Giving up waiting for proxies");
                        return Ok(());
                    }
                    tokio::time::sleep(self.idle_delay(proxy_waits)).await;
                }
            }
        }
    }

    async fn process_job(
        &self,
        job: Job,
        mut proxy: Option<ProxyRecord>,
        run: &mut CrawlRun,
    ) -> PipelineResult<JobOutcome> {
        let mut payload = job.payload.clone();
        let mut cursor = payload.get(CURSOR_KEY).filter(|c| !c.is_null()).cloned();
        let mut pages_done = payload.get(PAGES_DONE_KEY).and_then(|v| v.as_u64()).unwrap_or(0);
        let mut records = 0u64;

        loop {
            // Jobs earlier in the batch may have outlived this one's lease
            if let Err(e) = self.renew(&job).await {
                return self.settle(Err(e), JobOutcome::LeaseLost);
            }

            let page = match self.fetch_with_retry(&job, cursor.as_ref(), &mut proxy).await {
                Ok(page) => page,
                Err(FetchFailure::Blocked(reason)) => {
                    if let Some(peer) = &self.relay_to {
                        return self.relay(&job, peer, &reason).await;
                    }
                    return self.fail(&job, &format!("blocked: {}", reason)).await;
                }
                Err(FetchFailure::Exhausted(reason)) => {
                    return self.fail(&job, &format!("retries exhausted: {}", reason)).await;
                }
                Err(FetchFailure::Fatal(reason)) => return self.fail(&job, &reason).await,
                Err(FetchFailure::NoProxies) => {
                    return self.settle(self.coordinator.release(job.id, &self.id).await, JobOutcome::Released);
                }
                Err(FetchFailure::LeaseLost) => {
                    tracing::warn!(job_id = %job.id, worker_id = %self.id, "Lease lost between fetch attempts");
                    return Ok(JobOutcome::LeaseLost);
                }
                Err(FetchFailure::Pipeline(e)) => return Err(e),
            };

            let Page { records: listings, next_cursor } = page;
            for listing in listings {
                match self.pipeline.ingest_and_apply(listing).await {
                    Ok(outcome) => {
                        run.record(&outcome);
                        records += 1;
                    }
                    Err(e) => return self.fail(&job, &e.to_string()).await,
                }
            }
            pages_done += 1;
            run.pages += 1;

            let Some(next) = next_cursor else {
                let result = json!({ "pages": pages_done, "records": records });
                return self.settle(
                    self.coordinator.complete(job.id, &self.id, result).await,
                    JobOutcome::Completed,
                );
            };

            if let Some(map) = payload.as_object_mut() {
                map.insert(CURSOR_KEY.to_string(), next.clone());
                map.insert(PAGES_DONE_KEY.to_string(), json!(pages_done));
            }
            if let Err(e) = self.coordinator.checkpoint(job.id, &self.id, &payload).await {
                return self.settle(Err(e), JobOutcome::LeaseLost);
            }
            cursor = Some(next);
        }
    }

    async fn fetch_with_retry(
        &self,
        job: &Job,
        cursor: Option<&serde_json::Value>,
        proxy: &mut Option<ProxyRecord>,
    ) -> Result<Page, FetchFailure> {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                self.renew(job).await?;
            }
            match self.adapter.fetch_next_page(job, cursor, proxy.as_ref()).await {
                Ok(page) => {
                    if let Some(p) = proxy.as_ref() {
                        self.proxies.report(&p.endpoint, true).await?;
                    }
                    return Ok(page);
                }
                Err(AdapterError::Transient(reason)) => {
                    if let Some(p) = proxy.as_ref() {
                        self.proxies.report(&p.endpoint, false).await?;
                    }
                    attempt += 1;
                    if attempt > self.config.fetch_retries {
                        return Err(FetchFailure::Exhausted(reason));
                    }
                    tracing::debug!(job_id = %job.id, attempt, reason, "Transient fetch error, retrying");
                    tokio::time::sleep(self.retry_delay(attempt)).await;
                }
                Err(AdapterError::Blocked(reason)) => {
                    if let Some(p) = proxy.take() {
                        self.proxies.report_ban(&p.endpoint, self.source_id()).await?;
                    }
                    attempt += 1;
                    if self.relay_to.is_some() || attempt > self.config.fetch_retries {
                        return Err(FetchFailure::Blocked(reason));
                    }
                    if self.adapter.needs_proxy() {
                        let fresh = self.proxies.acquire_working_for(self.source_id(), 1).await?;
                        *proxy = fresh.into_iter().next();
                    }
                }
                Err(AdapterError::Fatal(reason)) => return Err(FetchFailure::Fatal(reason)),
            }
        }
    }

    /// Extend the lease, failing with `LeaseConflict` if it is no longer ours
    async fn renew(&self, job: &Job) -> PipelineResult<()> {
        self.coordinator
            .renew_lease(job.id, &self.id, self.coordinator.config().lease())
            .await
            .map(|_| ())
    }

    async fn fail(&self, job: &Job, reason: &str) -> PipelineResult<JobOutcome> {
        let result = self.coordinator.fail(job.id, &self.id, reason).await;
        match result {
            Ok(outcome) => Ok(JobOutcome::Failed(outcome)),
            Err(e) => self.settle(Err(e), JobOutcome::LeaseLost),
        }
    }

    async fn relay(&self, job: &Job, peer: &WorkerId, reason: &str) -> PipelineResult<JobOutcome> {
        let lease = self.coordinator.config().lease();
        let relayed = self
            .coordinator
            .relay(job.id, &self.id, peer, lease, Some(&format!("blocked by source: {}", reason)))
            .await
            .map(|_| ());
        self.settle(relayed, JobOutcome::Relayed)
    }

    /// Map a lease conflict to `LeaseLost`, propagate anything else
    fn settle(&self, result: PipelineResult<()>, on_success: JobOutcome) -> PipelineResult<JobOutcome> {
        match result {
            Ok(()) => Ok(on_success),
            Err(PipelineError::LeaseConflict { job_id, .. }) => {
                tracing::warn!(job_id = %job_id, worker_id = %self.id, "Lease lost to another worker");
                Ok(JobOutcome::LeaseLost)
            }
            Err(e) => Err(e),
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        backoff::jittered(backoff::exponential(
            attempt.saturating_sub(1),
            Duration::from_millis(self.config.retry_base_ms),
            Duration::from_secs(self.config.max_backoff_secs),
        ))
    }

    fn idle_delay(&self, round: u32) -> Duration {
        backoff::jittered(backoff::exponential(
            round.saturating_sub(1),
            Duration::from_secs(self.config.idle_backoff_secs),
            Duration::from_secs(self.config.max_backoff_secs),
        ))
    }
}
