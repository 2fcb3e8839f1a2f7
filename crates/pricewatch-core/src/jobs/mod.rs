//! Job coordination
//!
//! Generic exclusive work claiming over the durable `jobs` table. Used for
//! proxy health checks and for crawl work handed between servers.

pub mod coordinator;
pub mod types;

pub use coordinator::JobCoordinator;
pub use types::{Enqueued, FailOutcome, Job, JobKind, JobStats, JobStatus, NewJob};
