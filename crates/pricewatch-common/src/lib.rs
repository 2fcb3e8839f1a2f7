//! Pricewatch Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Pricewatch workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Common error type and result alias
//! - **Logging**: Centralised `tracing` subscriber setup
//! - **Checksums**: Stable fingerprints for job payloads
//! - **Types**: Worker identity shared by every coordinating process
//!
//! # Example
//!
//! ```no_run
//! use pricewatch_common::logging::{init_logging, LogConfig};
//! use pricewatch_common::types::WorkerId;
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     let me = WorkerId::from_host("crawler");
//!     tracing::info!(worker_id = %me, "worker online");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::WorkerId;
