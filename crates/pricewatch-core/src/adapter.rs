//! Source adapter seam
//!
//! Fetching, parsing and pagination are per-source concerns that live
//! outside this crate. An adapter turns one page of a crawl job into raw
//! [`StagingRecord`]s and tells the worker where the next page starts.

use async_trait::async_trait;
use thiserror::Error;

use crate::ingest::StagingRecord;
use crate::jobs::Job;
use crate::proxy::ProxyRecord;

/// One page of listings
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<StagingRecord>,
    /// Where the next page starts; `None` once the job's listing is exhausted
    pub next_cursor: Option<serde_json::Value>,
}

impl Page {
    pub fn last(records: Vec<StagingRecord>) -> Self {
        Self {
            records,
            next_cursor: None,
        }
    }

    pub fn with_next(records: Vec<StagingRecord>, cursor: serde_json::Value) -> Self {
        Self {
            records,
            next_cursor: Some(cursor),
        }
    }
}

/// Adapter failure classes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Network or timeout; retried with backoff by the worker
    #[error("Transient fetch error: {0}")]
    Transient(String),

    /// The source refused this egress endpoint
    #[error("Blocked by source: {0}")]
    Blocked(String),

    /// Not worth retrying; fails the job attempt
    #[error("Fatal adapter error: {0}")]
    Fatal(String),
}

/// Capability set of one source
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Namespace for articles, outlets and staleness
    fn source_id(&self) -> &str;

    /// Whether fetches go through the proxy pool
    fn needs_proxy(&self) -> bool {
        true
    }

    async fn fetch_next_page(
        &self,
        job: &Job,
        cursor: Option<&serde_json::Value>,
        proxy: Option<&ProxyRecord>,
    ) -> Result<Page, AdapterError>;
}
