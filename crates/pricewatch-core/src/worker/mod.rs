//! Long-running drivers for the pipeline components
//!
//! [`CrawlWorker`] runs a source adapter against claimed crawl jobs;
//! [`ProxyChecker`] keeps the proxy pool's health current.

pub mod backoff;
pub mod checker;
pub mod crawl;

pub use checker::{CheckSummary, HttpProbe, ProxyChecker, ProxyProbe};
pub use crawl::{BatchOutcome, CrawlRun, CrawlWorker};
