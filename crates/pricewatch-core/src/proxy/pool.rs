//! Proxy pool backed by the `proxies` table

use chrono::Duration;
use pricewatch_common::WorkerId;
use sqlx::PgPool;

use super::types::{next_status, normalize_endpoint, ImportSummary, ProxyRecord, ProxyStats, ProxyStatus};
use crate::clock::SharedClock;
use crate::config::ProxyConfig;
use crate::error::{PipelineError, PipelineResult};

/// Shared egress pool for crawlers and health checkers
#[derive(Clone)]
pub struct ProxyPool {
    pool: PgPool,
    clock: SharedClock,
    config: ProxyConfig,
}

impl ProxyPool {
    pub fn new(pool: PgPool, clock: SharedClock, config: ProxyConfig) -> Self {
        Self { pool, clock, config }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Insert newly discovered endpoints; known ones are left untouched
    #[tracing::instrument(skip_all)]
    pub async fn import<I, S>(&self, endpoints: I) -> PipelineResult<ImportSummary>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut summary = ImportSummary::default();
        let mut normalized = Vec::new();
        for raw in endpoints {
            let raw = raw.as_ref();
            match normalize_endpoint(raw) {
                Some(endpoint) => normalized.push(endpoint),
                None if raw.trim().is_empty() || raw.trim_start().starts_with('#') => {}
                None => {
                    tracing::debug!(line = raw, "Skipping invalid proxy endpoint");
                    summary.invalid += 1;
                }
            }
        }
        normalized.sort();
        normalized.dedup();

        let result = sqlx::query(
            r#"
            INSERT INTO proxies (endpoint, status, created_at)
            SELECT endpoint, 'unchecked', $2 FROM UNNEST($1::text[]) AS t(endpoint)
            ON CONFLICT (endpoint) DO NOTHING
            "#,
        )
        .bind(&normalized)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        summary.inserted = result.rows_affected();
        summary.already_known = normalized.len() as u64 - summary.inserted;

        tracing::info!(
            inserted = summary.inserted,
            already_known = summary.already_known,
            invalid = summary.invalid,
            "Proxy import finished"
        );
        Ok(summary)
    }

    /// Lease up to `max_n` proxies that are unchecked or due for re-check
    ///
    /// Same claim semantics as the job coordinator: rows locked or leased by
    /// another checker are skipped.
    #[tracing::instrument(skip(self), fields(checker_id = %checker_id))]
    pub async fn check_batch(
        &self,
        checker_id: &WorkerId,
        max_n: i64,
        lease_duration: Duration,
    ) -> PipelineResult<Vec<ProxyRecord>> {
        if max_n <= 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let recheck_before = now - self.config.recheck_after();

        let records = sqlx::query_as(
            r#"
            WITH picked AS (
                SELECT endpoint FROM proxies
                WHERE (status = 'unchecked' OR last_checked_at <= $2)
                  AND (check_claimed_by IS NULL OR check_lease_expires_at <= $1)
                ORDER BY (status = 'unchecked') DESC, last_checked_at NULLS FIRST, created_at, endpoint
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE proxies p
            SET check_claimed_by = $4, check_lease_expires_at = $5
            FROM picked
            WHERE p.endpoint = picked.endpoint
            RETURNING p.*
            "#,
        )
        .bind(now)
        .bind(recheck_before)
        .bind(max_n)
        .bind(checker_id.as_str())
        .bind(now + lease_duration)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Record a crawl outcome
    ///
    /// A check lease is left alone unless it has already expired.
    pub async fn report(&self, endpoint: &str, success: bool) -> PipelineResult<ProxyStatus> {
        self.record_outcome(endpoint, success, None).await
    }

    /// Record a health-check result and release the caller's check lease
    ///
    /// A lease that expired and went to another checker stays with that
    /// checker.
    pub async fn report_check(
        &self,
        endpoint: &str,
        checker_id: &WorkerId,
        success: bool,
    ) -> PipelineResult<ProxyStatus> {
        self.record_outcome(endpoint, success, Some(checker_id)).await
    }

    #[tracing::instrument(skip(self, checker_id))]
    async fn record_outcome(
        &self,
        endpoint: &str,
        success: bool,
        checker_id: Option<&WorkerId>,
    ) -> PipelineResult<ProxyStatus> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let current: Option<(String, i32)> = sqlx::query_as(
            "SELECT status, consecutive_failures FROM proxies WHERE endpoint = $1 FOR UPDATE",
        )
        .bind(endpoint)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status, failures)) = current else {
            return Err(PipelineError::InvalidEndpoint(format!("unknown proxy {}", endpoint)));
        };
        let current: ProxyStatus = status
            .parse()
            .map_err(|e: String| PipelineError::InvalidEndpoint(e))?;

        let failures = if success { 0 } else { failures + 1 };
        let next = next_status(current, success, failures, self.config.failure_threshold);

        sqlx::query(
            r#"
            UPDATE proxies
            SET status = $2,
                consecutive_failures = $3,
                success_count = success_count + CASE WHEN $4 THEN 1 ELSE 0 END,
                failure_count = failure_count + CASE WHEN $4 THEN 0 ELSE 1 END,
                last_checked_at = $5,
                check_claimed_by = CASE
                    WHEN check_lease_expires_at <= $5 OR check_claimed_by = $6 THEN NULL
                    ELSE check_claimed_by
                END,
                check_lease_expires_at = CASE
                    WHEN check_lease_expires_at <= $5 OR check_claimed_by = $6 THEN NULL
                    ELSE check_lease_expires_at
                END
            WHERE endpoint = $1
            "#,
        )
        .bind(endpoint)
        .bind(next.as_str())
        .bind(failures)
        .bind(success)
        .bind(now)
        .bind(checker_id.map(WorkerId::as_str))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if next != current {
            tracing::info!(endpoint, from = %current, to = %next, "Proxy status changed");
        }
        Ok(next)
    }

    /// Record that `source_id` blocked this endpoint
    ///
    /// A proxy banned by `ban_limit` distinct sources is retired as dead.
    #[tracing::instrument(skip(self))]
    pub async fn report_ban(&self, endpoint: &str, source_id: &str) -> PipelineResult<ProxyStatus> {
        let row: Option<(String, i32)> = sqlx::query_as(
            r#"
            UPDATE proxies
            SET banned_sources = CASE
                    WHEN $2 = ANY(banned_sources) THEN banned_sources
                    ELSE array_append(banned_sources, $2)
                END,
                status = CASE
                    WHEN cardinality(banned_sources) + (CASE WHEN $2 = ANY(banned_sources) THEN 0 ELSE 1 END) >= $3
                    THEN 'dead'
                    ELSE status
                END
            WHERE endpoint = $1
            RETURNING status, cardinality(banned_sources)
            "#,
        )
        .bind(endpoint)
        .bind(source_id)
        .bind(self.config.ban_limit)
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, bans)) = row else {
            return Err(PipelineError::InvalidEndpoint(format!("unknown proxy {}", endpoint)));
        };
        let status: ProxyStatus = status.parse().map_err(PipelineError::InvalidEndpoint)?;

        tracing::warn!(endpoint, source_id, bans, status = %status, "Proxy banned by source");
        Ok(status)
    }

    /// Least-recently-used sample of working proxies
    pub async fn acquire_working(&self, n: i64) -> PipelineResult<Vec<ProxyRecord>> {
        self.acquire(None, n).await
    }

    /// Working proxies not banned by `source_id`
    pub async fn acquire_working_for(&self, source_id: &str, n: i64) -> PipelineResult<Vec<ProxyRecord>> {
        self.acquire(Some(source_id), n).await
    }

    async fn acquire(&self, source_id: Option<&str>, n: i64) -> PipelineResult<Vec<ProxyRecord>> {
        let records: Vec<ProxyRecord> = sqlx::query_as(
            r#"
            WITH picked AS (
                SELECT endpoint FROM proxies
                WHERE status = 'working'
                  AND ($2::text IS NULL OR NOT ($2 = ANY(banned_sources)))
                ORDER BY last_used_at NULLS FIRST, endpoint
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE proxies p
            SET last_used_at = $1
            FROM picked
            WHERE p.endpoint = picked.endpoint
            RETURNING p.*
            "#,
        )
        .bind(self.clock.now())
        .bind(source_id)
        .bind(n.max(1))
        .fetch_all(&self.pool)
        .await?;

        if records.is_empty() {
            tracing::warn!(source_id, "No healthy proxies available");
            return Err(PipelineError::NoHealthyProxies);
        }
        Ok(records)
    }

    pub async fn get(&self, endpoint: &str) -> PipelineResult<Option<ProxyRecord>> {
        let record = sqlx::query_as("SELECT * FROM proxies WHERE endpoint = $1")
            .bind(endpoint)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Proxy counts per status
    pub async fn stats(&self) -> PipelineResult<ProxyStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM proxies GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = ProxyStats::default();
        for (status, count) in rows {
            match status.parse::<ProxyStatus>() {
                Ok(ProxyStatus::Unchecked) => stats.unchecked = count,
                Ok(ProxyStatus::Working) => stats.working = count,
                Ok(ProxyStatus::Dead) => stats.dead = count,
                Err(e) => tracing::warn!(error = %e, "Ignoring unknown proxy status"),
            }
        }
        Ok(stats)
    }
}
