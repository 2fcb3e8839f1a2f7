//! Price ledger
//!
//! Sole owner of `price_snapshots` and `price_history`.

pub mod price_ledger;
pub mod types;

pub use price_ledger::PriceLedger;
pub use types::{decide_change, ApplyOutcome, HistoryReason, PriceHistoryEntry, PriceSnapshot};
