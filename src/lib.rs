//! CrawlGrid - a programmable multi-phase web crawling engine
//!
//! The library is organized around a small set of collaborators:
//! - Workflows: typed, validated descriptions of what to crawl
//! - The frontier: a durable, deduplicating URL queue with leased claims
//! - The browser pool: bounded sessions behind a driver trait
//! - The recovery engine: rule-based handling of recoverable failures
//! - The executor: phase-by-phase orchestration tying it all together

pub mod browser;
pub mod config;
pub mod error;
pub mod executor;
pub mod frontier;
pub mod logging;
pub mod nodes;
pub mod recovery;
pub mod stats;
pub mod storage;
pub mod workflow;

// Re-export main types for convenience
pub use crate::config::AppConfig;
pub use crate::error::{CrawlError, CrawlResult};
pub use crate::executor::CrawlExecutor;
pub use crate::storage::Storage;
pub use crate::workflow::Workflow;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
