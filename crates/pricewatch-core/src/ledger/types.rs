//! Snapshot and history model

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use std::str::FromStr;

/// Current price of one (entity, outlet) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PriceSnapshot {
    pub nomenclature_id: i64,
    pub outlet_id: i64,
    pub source_id: String,
    pub price: BigDecimal,
    pub old_price: Option<BigDecimal>,
    pub quantity: i32,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryReason {
    FirstSeen,
    Changed,
    /// Missing from a full crawl; quantity forced to zero
    Stale,
}

impl HistoryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryReason::FirstSeen => "first_seen",
            HistoryReason::Changed => "changed",
            HistoryReason::Stale => "stale",
        }
    }
}

impl FromStr for HistoryReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_seen" => Ok(HistoryReason::FirstSeen),
            "changed" => Ok(HistoryReason::Changed),
            "stale" => Ok(HistoryReason::Stale),
            other => Err(format!("unknown history reason '{}'", other)),
        }
    }
}

/// Immutable change record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub id: i64,
    pub nomenclature_id: i64,
    pub outlet_id: i64,
    pub previous_price: Option<BigDecimal>,
    pub previous_quantity: Option<i32>,
    pub price: BigDecimal,
    pub quantity: i32,
    pub reason: HistoryReason,
    pub changed_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for PriceHistoryEntry {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        let reason: String = row.try_get("reason")?;
        Ok(Self {
            id: row.try_get("id")?,
            nomenclature_id: row.try_get("nomenclature_id")?,
            outlet_id: row.try_get("outlet_id")?,
            previous_price: row.try_get("previous_price")?,
            previous_quantity: row.try_get("previous_quantity")?,
            price: row.try_get("price")?,
            quantity: row.try_get("quantity")?,
            reason: reason.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
                index: "reason".to_string(),
                source: e.into(),
            })?,
            changed_at: row.try_get("changed_at")?,
        })
    }
}

/// What `apply` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// No snapshot existed; one history entry written
    FirstSeen,
    /// Price or quantity changed; one history entry written
    Changed,
    /// Same values; only `last_seen_at` moved
    Unchanged,
    /// Observation older than the snapshot's `last_seen_at`; ignored
    Stale,
}

impl ApplyOutcome {
    pub fn wrote_history(&self) -> bool {
        matches!(self, ApplyOutcome::FirstSeen | ApplyOutcome::Changed)
    }
}

/// Decide what an observation does to the current snapshot
///
/// Prices are compared as exact decimals, so `1299.00` equals `1299`.
pub fn decide_change(
    current: Option<&PriceSnapshot>,
    price: &BigDecimal,
    quantity: i32,
    observed_at: DateTime<Utc>,
) -> ApplyOutcome {
    let Some(current) = current else {
        return ApplyOutcome::FirstSeen;
    };
    if observed_at < current.last_seen_at {
        return ApplyOutcome::Stale;
    }
    if &current.price != price || current.quantity != quantity {
        ApplyOutcome::Changed
    } else {
        ApplyOutcome::Unchanged
    }
}
