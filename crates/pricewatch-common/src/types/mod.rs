//! Common types used across Pricewatch

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CommonError, Result};

/// Maximum accepted length of a worker identity
pub const MAX_WORKER_ID_LEN: usize = 128;

/// Identity of a coordinating process (crawler, proxy checker, ingestion consumer).
///
/// Stored verbatim in `claimed_by` columns, so it must be stable for the
/// lifetime of the process and unique across hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Validate and wrap an explicit identity
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(CommonError::InvalidWorkerId("worker id cannot be empty".to_string()));
        }
        if trimmed.len() > MAX_WORKER_ID_LEN {
            return Err(CommonError::InvalidWorkerId(format!(
                "worker id longer than {} characters",
                MAX_WORKER_ID_LEN
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Build `<role>@<hostname>/<short uuid>` for the current process
    pub fn from_host(role: &str) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}@{}/{}", role, host, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
