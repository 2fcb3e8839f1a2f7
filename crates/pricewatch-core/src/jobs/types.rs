//! Job model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use std::str::FromStr;
use uuid::Uuid;

/// What a job asks a worker to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ProxyCheck,
    CrawlPage,
    CrawlCategory,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::ProxyCheck, JobKind::CrawlPage, JobKind::CrawlCategory];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ProxyCheck => "proxy_check",
            JobKind::CrawlPage => "crawl_page",
            JobKind::CrawlCategory => "crawl_category",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proxy_check" => Ok(JobKind::ProxyCheck),
            "crawl_page" => Ok(JobKind::CrawlPage),
            "crawl_category" => Ok(JobKind::CrawlCategory),
            other => Err(format!("unknown job kind '{}'", other)),
        }
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Done,
    /// Parked after exhausting its retry budget
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A claimable unit of work (maps to the `jobs` table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    /// Source whose workers may claim this job; `None` for shared work
    pub source_id: Option<String>,
    /// Opaque parameters, including any checkpointed cursor
    pub payload: serde_json::Value,
    pub dedup_key: String,
    pub status: JobStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub relay_count: i32,
    pub relay_reason: Option<String>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn decode_enum<T: FromStr<Err = String>>(row: &PgRow, column: &str) -> sqlx::Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: e.into(),
    })
}

impl<'r> FromRow<'r, PgRow> for Job {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: decode_enum(row, "kind")?,
            source_id: row.try_get("source_id")?,
            payload: row.try_get("payload")?,
            dedup_key: row.try_get("dedup_key")?,
            status: decode_enum(row, "status")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: row.try_get("claimed_at")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            relay_count: row.try_get("relay_count")?,
            relay_reason: row.try_get("relay_reason")?,
            last_error: row.try_get("last_error")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

/// Parameters for enqueuing a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    /// Defaults to the coordinator's source scope
    pub source_id: Option<String>,
    pub payload: serde_json::Value,
    /// Explicit idempotency key; defaults to the payload fingerprint
    pub dedup_key: Option<String>,
    /// Overrides the coordinator's default retry budget
    pub max_attempts: Option<i32>,
}

impl NewJob {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            source_id: None,
            payload,
            dedup_key: None,
            max_attempts: None,
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: i32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Result of an enqueue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub id: Uuid,
    /// `false` when an equivalent live job already existed
    pub created: bool,
}

/// What `fail` did with the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending for another attempt
    Retrying { attempt: i32, remaining: i32 },
    /// Retry budget exhausted; parked as `failed`
    Parked { attempts: i32 },
}

impl FailOutcome {
    /// Decide from the attempt count after this failure was recorded
    pub fn from_counts(attempts: i32, max_attempts: i32) -> Self {
        if attempts >= max_attempts {
            FailOutcome::Parked { attempts }
        } else {
            FailOutcome::Retrying {
                attempt: attempts,
                remaining: max_attempts - attempts,
            }
        }
    }

    pub fn is_parked(&self) -> bool {
        matches!(self, FailOutcome::Parked { .. })
    }
}

/// Job counts per status for one kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: i64,
    pub claimed: i64,
    pub done: i64,
    pub failed: i64,
}

impl JobStats {
    pub fn total(&self) -> i64 {
        self.pending + self.claimed + self.done + self.failed
    }

    /// No live work left for this kind
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.claimed == 0
    }
}
