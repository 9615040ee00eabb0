//! perfbisect-state: SurrealDB persistence for bisection jobs
//!
//! This crate is the persistence layer for perfbisect. A bisection can run
//! for hours, so every job is recorded together with an append-only journal
//! of the steps it has already completed. A restarted process replays that
//! journal instead of repeating remote work.
//!
//! ## Key Components
//!
//! - [`JobLedger`]: backend-agnostic job + step journal contract
//! - [`SurrealJobLedger`]: SurrealDB implementation
//! - [`fakes::MemoryJobLedger`]: in-memory implementation for tests

mod error;
pub mod fakes;
mod handle;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_ledger;

pub use error::{StateError, StorageError};
pub use handle::{connect_cloud, connect_from_env, connect_memory, connect_url, CloudConfig};
pub use schema::{JobRow, StepRow};
pub use storage_traits::{
    ContentDigest, CulpritRef, JobId, JobLedger, JobMetadata, JobOutcome, JobRecord, JobStatus,
    StepEvent, StorageResult,
};
pub use surreal_ledger::SurrealJobLedger;

/// Result type for perfbisect-state connection operations
pub type Result<T> = std::result::Result<T, StateError>;
