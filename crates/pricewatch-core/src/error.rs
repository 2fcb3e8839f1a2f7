//! Pipeline error taxonomy
//!
//! Expected race outcomes are not errors: a claim that finds nothing returns
//! an empty batch, and a low-confidence match becomes a review-queue row.
//! What remains here is either a caller mistake, an exhausted resource the
//! caller must back off from, or a store failure.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Pool(#[from] crate::db::DbError),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed record field '{field}': {reason}")]
    MalformedRecord { field: &'static str, reason: String },

    /// No `working` proxy is available; callers back off instead of polling.
    #[error("No healthy proxies available")]
    NoHealthyProxies,

    /// The caller does not hold a live lease on the job.
    #[error("Job {job_id} is not leased by {worker_id}")]
    LeaseConflict { job_id: Uuid, worker_id: String },

    /// The job failed beyond its retry budget and was parked.
    #[error("Job {job_id} exhausted {attempts} attempts")]
    JobExhausted { job_id: Uuid, attempts: i32 },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Review item not found: {0}")]
    ReviewNotFound(i64),

    #[error("Invalid review decision: {0}")]
    InvalidReview(String),

    #[error("Invalid proxy endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] pricewatch_common::CommonError),
}

impl PipelineError {
    pub fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            field,
            reason: reason.into(),
        }
    }

    /// Whether the caller should wait and retry rather than give up
    pub fn is_backoff(&self) -> bool {
        matches!(self, PipelineError::NoHealthyProxies)
    }
}
