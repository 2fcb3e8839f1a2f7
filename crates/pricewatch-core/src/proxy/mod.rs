//! Proxy health pool
//!
//! Crawlers draw working endpoints from here and report outcomes back into
//! the same rows that health checkers maintain.

pub mod pool;
pub mod types;

pub use pool::ProxyPool;
pub use types::{next_status, normalize_endpoint, ImportSummary, ProxyRecord, ProxyStats, ProxyStatus};
