//! Proxy model and health transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use std::str::FromStr;

/// Health of an egress endpoint
///
/// Transitions are `unchecked -> {working, dead}` and `working <-> dead`;
/// nothing returns to `unchecked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Unchecked,
    Working,
    Dead,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Unchecked => "unchecked",
            ProxyStatus::Working => "working",
            ProxyStatus::Dead => "dead",
        }
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unchecked" => Ok(ProxyStatus::Unchecked),
            "working" => Ok(ProxyStatus::Working),
            "dead" => Ok(ProxyStatus::Dead),
            other => Err(format!("unknown proxy status '{}'", other)),
        }
    }
}

/// Status after one probe or crawl outcome
///
/// `failures` is the consecutive failure count including this outcome. An
/// unchecked proxy that fails its first probe is dead straight away; a
/// working one gets `threshold` strikes.
pub fn next_status(current: ProxyStatus, success: bool, failures: i32, threshold: i32) -> ProxyStatus {
    if success {
        return ProxyStatus::Working;
    }
    match current {
        ProxyStatus::Unchecked | ProxyStatus::Dead => ProxyStatus::Dead,
        ProxyStatus::Working if failures >= threshold => ProxyStatus::Dead,
        ProxyStatus::Working => ProxyStatus::Working,
    }
}

/// Canonical `[user:pass@]host:port` form of an endpoint line
///
/// Returns `None` for blank lines, comments and anything without a valid
/// port.
pub fn normalize_endpoint(raw: &str) -> Option<String> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let without_scheme = line.split_once("://").map_or(line, |(_, rest)| rest);
    let trimmed = without_scheme.trim_end_matches('/');

    let (credentials, address) = match trimmed.rsplit_once('@') {
        Some((creds, addr)) if !creds.is_empty() => (Some(creds), addr),
        Some(_) => return None,
        None => (None, trimmed),
    };

    let (host, port) = address.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if port == 0 || host.is_empty() {
        return None;
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return None;
    }

    let host = host.to_ascii_lowercase();
    Some(match credentials {
        Some(creds) => format!("{}@{}:{}", creds, host, port),
        None => format!("{}:{}", host, port),
    })
}

/// One egress endpoint (maps to the `proxies` table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub endpoint: String,
    pub status: ProxyStatus,
    pub consecutive_failures: i32,
    pub success_count: i64,
    pub failure_count: i64,
    /// Sources that have blocked this endpoint
    pub banned_sources: Vec<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Checker currently holding the health-check lease
    pub check_claimed_by: Option<String>,
    pub check_lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ProxyRecord {
    /// `http://` URL suitable for an HTTP client proxy setting
    pub fn url(&self) -> String {
        format!("http://{}", self.endpoint)
    }

    pub fn is_banned_by(&self, source_id: &str) -> bool {
        self.banned_sources.iter().any(|s| s == source_id)
    }
}

impl<'r> FromRow<'r, PgRow> for ProxyRecord {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            endpoint: row.try_get("endpoint")?,
            status: status.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: e.into(),
            })?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            success_count: row.try_get("success_count")?,
            failure_count: row.try_get("failure_count")?,
            banned_sources: row.try_get("banned_sources")?,
            last_checked_at: row.try_get("last_checked_at")?,
            last_used_at: row.try_get("last_used_at")?,
            check_claimed_by: row.try_get("check_claimed_by")?,
            check_lease_expires_at: row.try_get("check_lease_expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Result of importing an endpoint list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: u64,
    pub already_known: u64,
    pub invalid: u64,
}

/// Proxy counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProxyStats {
    pub unchecked: i64,
    pub working: i64,
    pub dead: i64,
}

impl ProxyStats {
    pub fn total(&self) -> i64 {
        self.unchecked + self.working + self.dead
    }
}
