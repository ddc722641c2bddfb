//! icemaint core - table maintenance for snapshot-versioned columnar tables
//!
//! This library decides which data files to rewrite or delete and commits
//! the result safely under optimistic concurrency:
//!
//! - Compaction of small files into target-sized ones, optionally sorted
//! - Snapshot expiry under a retention policy
//! - Orphan file removal with a grace period
//! - Named procedures with up-front parameter validation

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod maintenance;
pub mod memory;
pub mod metadata;
pub mod metrics;
pub mod procedures;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use engine::MaintenanceEngine;
pub use error::{CatalogError, PlanningError, ProcedureError, StorageError};
pub use error::{Error, Result};
pub use maintenance::Stats;
pub use procedures::ProcedureDispatcher;
