//! Lease-based job coordinator
//!
//! Every ownership decision is a single statement against the `jobs` table.
//! Claims lock candidate rows with `FOR UPDATE SKIP LOCKED`, so concurrent
//! claimants see disjoint sets and never wait on each other. An expired lease
//! makes the row claimable again from inside the same claim query; there is
//! no reaper process.
//!
//! A coordinator may be scoped to one source with [`JobCoordinator::for_source`];
//! a scoped coordinator enqueues, claims and counts only that source's jobs.

use chrono::{DateTime, Duration, Utc};
use pricewatch_common::checksum::payload_fingerprint;
use pricewatch_common::WorkerId;
use sqlx::PgPool;
use uuid::Uuid;

use super::types::{Enqueued, FailOutcome, Job, JobKind, JobStats, JobStatus, NewJob};
use crate::clock::SharedClock;
use crate::config::JobsConfig;
use crate::error::{PipelineError, PipelineResult};

/// Enqueue retries when the live duplicate disappears between insert and lookup
const ENQUEUE_RACE_RETRIES: usize = 3;

/// Coordinates claimable work across independent worker processes
#[derive(Clone)]
pub struct JobCoordinator {
    pool: PgPool,
    clock: SharedClock,
    config: JobsConfig,
    source_id: Option<String>,
}

impl JobCoordinator {
    pub fn new(pool: PgPool, clock: SharedClock, config: JobsConfig) -> Self {
        Self {
            pool,
            clock,
            config,
            source_id: None,
        }
    }

    /// A coordinator restricted to `source_id`'s queue
    pub fn for_source(&self, source_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            ..self.clone()
        }
    }

    pub fn source_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Enqueue a job keyed by its payload fingerprint
    pub async fn enqueue(&self, kind: JobKind, payload: serde_json::Value) -> PipelineResult<Uuid> {
        Ok(self.enqueue_job(NewJob::new(kind, payload)).await?.id)
    }

    /// Enqueue a job unless an equivalent pending or claimed job exists
    #[tracing::instrument(skip(self, job), fields(kind = %job.kind))]
    pub async fn enqueue_job(&self, job: NewJob) -> PipelineResult<Enqueued> {
        let dedup_key = match job.dedup_key {
            Some(key) => key,
            None => payload_fingerprint(&job.payload)?,
        };
        let max_attempts = job.max_attempts.unwrap_or(self.config.max_attempts);
        let source_id = job.source_id.or_else(|| self.source_id.clone());

        for _ in 0..ENQUEUE_RACE_RETRIES {
            let now = self.clock.now();
            let inserted: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO jobs (
                    id, kind, source_id, payload, dedup_key, status, max_attempts, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $7)
                ON CONFLICT (COALESCE(source_id, ''), kind, dedup_key)
                    WHERE status IN ('pending', 'claimed') DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(job.kind.as_str())
            .bind(&source_id)
            .bind(&job.payload)
            .bind(&dedup_key)
            .bind(max_attempts)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = inserted {
                tracing::debug!(job_id = %id, "Job enqueued");
                return Ok(Enqueued { id, created: true });
            }

            let existing: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT id FROM jobs
                WHERE kind = $1
                  AND dedup_key = $2
                  AND COALESCE(source_id, '') = COALESCE($3, '')
                  AND status IN ('pending', 'claimed')
                "#,
            )
            .bind(job.kind.as_str())
            .bind(&dedup_key)
            .bind(&source_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = existing {
                tracing::debug!(job_id = %id, "Equivalent live job already queued");
                return Ok(Enqueued { id, created: false });
            }
        }

        Err(PipelineError::Database(sqlx::Error::Protocol(format!(
            "enqueue of {} job did not settle after {} attempts",
            job.kind, ENQUEUE_RACE_RETRIES
        ))))
    }

    /// Claim up to `max_n` pending or lease-expired jobs of `kind`
    ///
    /// A scoped coordinator only claims its own source's jobs. Rows locked by another in-flight claim are skipped, so a lost race
    /// shows up as a shorter (possibly empty) batch rather than an error.
    #[tracing::instrument(skip(self), fields(kind = %kind, worker_id = %worker_id))]
    pub async fn claim_batch(
        &self,
        kind: JobKind,
        worker_id: &WorkerId,
        max_n: i64,
        lease_duration: Duration,
    ) -> PipelineResult<Vec<Job>> {
        if max_n <= 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let lease_expires_at = now + lease_duration;

        let mut jobs: Vec<Job> = sqlx::query_as(
            r#"
            WITH picked AS (
                SELECT id FROM jobs
                WHERE kind = $1
                  AND ($6::text IS NULL OR source_id = $6)
                  AND (status = 'pending' OR (status = 'claimed' AND lease_expires_at <= $2))
                ORDER BY created_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = 'claimed',
                claimed_by = $4,
                claimed_at = $2,
                lease_expires_at = $5,
                updated_at = $2
            FROM picked
            WHERE j.id = picked.id
            RETURNING j.*
            "#,
        )
        .bind(kind.as_str())
        .bind(now)
        .bind(max_n)
        .bind(worker_id.as_str())
        .bind(lease_expires_at)
        .bind(&self.source_id)
        .fetch_all(&self.pool)
        .await?;

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        if !jobs.is_empty() {
            tracing::info!(claimed = jobs.len(), "Claimed job batch");
        }

        Ok(jobs)
    }

    /// Mark a claimed job done
    #[tracing::instrument(skip(self, result), fields(worker_id = %worker_id))]
    pub async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &WorkerId,
        result: serde_json::Value,
    ) -> PipelineResult<()> {
        let now = self.clock.now();
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done',
                result = $3,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                updated_at = $4,
                completed_at = $4
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id.as_str())
        .bind(&result)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.lease_error(job_id, worker_id).await);
        }

        tracing::info!(job_id = %job_id, "Job completed");
        Ok(())
    }

    /// Record a failed attempt; retry while budget remains, park otherwise
    #[tracing::instrument(skip(self, error), fields(worker_id = %worker_id))]
    pub async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &WorkerId,
        error: &str,
    ) -> PipelineResult<FailOutcome> {
        let now = self.clock.now();
        let row: Option<(i32, i32)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET attempt_count = attempt_count + 1,
                status = CASE WHEN attempt_count + 1 >= max_attempts THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN attempt_count + 1 >= max_attempts THEN $4 ELSE NULL END,
                last_error = $3,
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                updated_at = $4
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            RETURNING attempt_count, max_attempts
            "#,
        )
        .bind(job_id)
        .bind(worker_id.as_str())
        .bind(error)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some((attempts, max_attempts)) = row else {
            return Err(self.lease_error(job_id, worker_id).await);
        };

        let outcome = FailOutcome::from_counts(attempts, max_attempts);
        match outcome {
            FailOutcome::Retrying { attempt, remaining } => {
                tracing::warn!(job_id = %job_id, attempt, remaining, error, "Job failed, will retry");
            }
            FailOutcome::Parked { attempts } => {
                tracing::error!(job_id = %job_id, attempts, error, "Job exhausted retry budget, parked");
            }
        }

        Ok(outcome)
    }

    /// Hand a claimed job to another worker, keeping its payload
    ///
    /// The previous owner loses the lease in the same statement that grants
    /// it to `to_worker`.
    #[tracing::instrument(skip(self), fields(from = %from_worker, to = %to_worker))]
    pub async fn relay(
        &self,
        job_id: Uuid,
        from_worker: &WorkerId,
        to_worker: &WorkerId,
        lease_duration: Duration,
        reason: Option<&str>,
    ) -> PipelineResult<Job> {
        let now = self.clock.now();
        let job: Option<Job> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET claimed_by = $3,
                claimed_at = $4,
                lease_expires_at = $5,
                relay_count = relay_count + 1,
                relay_reason = $6,
                updated_at = $4
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(from_worker.as_str())
        .bind(to_worker.as_str())
        .bind(now)
        .bind(now + lease_duration)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => {
                tracing::info!(job_id = %job_id, relay_count = job.relay_count, reason, "Job relayed");
                Ok(job)
            }
            None => Err(self.lease_error(job_id, from_worker).await),
        }
    }

    /// Give a claimed job back to the queue without spending an attempt
    #[tracing::instrument(skip(self), fields(worker_id = %worker_id))]
    pub async fn release(&self, job_id: Uuid, worker_id: &WorkerId) -> PipelineResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL,
                updated_at = $3
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id.as_str())
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.lease_error(job_id, worker_id).await);
        }
        tracing::info!(job_id = %job_id, "Job released");
        Ok(())
    }

    /// Persist partial progress into the payload while holding the lease
    #[tracing::instrument(skip(self, payload), fields(worker_id = %worker_id))]
    pub async fn checkpoint(
        &self,
        job_id: Uuid,
        worker_id: &WorkerId,
        payload: &serde_json::Value,
    ) -> PipelineResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET payload = $3, updated_at = $4
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id.as_str())
        .bind(payload)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.lease_error(job_id, worker_id).await);
        }
        Ok(())
    }

    /// Extend a held lease; returns the new expiry
    pub async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &WorkerId,
        lease_duration: Duration,
    ) -> PipelineResult<DateTime<Utc>> {
        let now = self.clock.now();
        let expires: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET lease_expires_at = $3, updated_at = $4
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            RETURNING lease_expires_at
            "#,
        )
        .bind(job_id)
        .bind(worker_id.as_str())
        .bind(now + lease_duration)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        match expires {
            Some(at) => Ok(at),
            None => Err(self.lease_error(job_id, worker_id).await),
        }
    }

    /// Jobs of `kind` this worker currently holds a live lease on
    ///
    /// This is how a relay target finds work handed to it.
    pub async fn owned(&self, kind: JobKind, worker_id: &WorkerId, limit: i64) -> PipelineResult<Vec<Job>> {
        let jobs = sqlx::query_as(
            r#"
            SELECT * FROM jobs
            WHERE kind = $1
              AND ($5::text IS NULL OR source_id = $5)
              AND status = 'claimed'
              AND claimed_by = $2
              AND lease_expires_at > $3
            ORDER BY created_at, id
            LIMIT $4
            "#,
        )
        .bind(kind.as_str())
        .bind(worker_id.as_str())
        .bind(self.clock.now())
        .bind(limit)
        .bind(&self.source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn get(&self, job_id: Uuid) -> PipelineResult<Job> {
        sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PipelineError::JobNotFound(job_id))
    }

    /// Job counts per status for one kind, within this coordinator's scope
    pub async fn stats(&self, kind: JobKind) -> PipelineResult<JobStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM jobs
            WHERE kind = $1 AND ($2::text IS NULL OR source_id = $2)
            GROUP BY status
            "#,
        )
        .bind(kind.as_str())
        .bind(&self.source_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => stats.pending = count,
                Ok(JobStatus::Claimed) => stats.claimed = count,
                Ok(JobStatus::Done) => stats.done = count,
                Ok(JobStatus::Failed) => stats.failed = count,
                Err(e) => tracing::warn!(error = %e, "Ignoring unknown job status"),
            }
        }
        Ok(stats)
    }

    /// Permanently failed jobs, most recent first
    pub async fn parked(&self, kind: JobKind, limit: i64) -> PipelineResult<Vec<Job>> {
        let jobs = sqlx::query_as(
            r#"
            SELECT * FROM jobs
            WHERE kind = $1 AND status = 'failed' AND ($3::text IS NULL OR source_id = $3)
            ORDER BY updated_at DESC, id
            LIMIT $2
            "#,
        )
        .bind(kind.as_str())
        .bind(limit)
        .bind(&self.source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Return a parked job to the queue with a fresh retry budget
    ///
    /// Returns `false` if the job is not parked or an equivalent live job
    /// has been enqueued since.
    pub async fn requeue_parked(&self, job_id: Uuid) -> PipelineResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', attempt_count = 0, completed_at = NULL, updated_at = $2
            WHERE id = $1
              AND status = 'failed'
              AND NOT EXISTS (
                  SELECT 1 FROM jobs live
                  WHERE live.kind = jobs.kind
                    AND live.source_id IS NOT DISTINCT FROM jobs.source_id
                    AND live.dedup_key = jobs.dedup_key
                    AND live.status IN ('pending', 'claimed')
              )
            "#,
        )
        .bind(job_id)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            self.get(job_id).await?;
            return Ok(false);
        }

        tracing::info!(job_id = %job_id, "Parked job requeued");
        Ok(true)
    }

    /// Explain why a lease-guarded update matched no row
    async fn lease_error(&self, job_id: Uuid, worker_id: &WorkerId) -> PipelineError {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await;

        match exists {
            Ok(0) => PipelineError::JobNotFound(job_id),
            Ok(_) => PipelineError::LeaseConflict {
                job_id,
                worker_id: worker_id.to_string(),
            },
            Err(e) => e.into(),
        }
    }
}
