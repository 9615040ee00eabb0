//! Domain models for perfbisect.
//!
//! - `Commit` / `CombinedCommit` / `CommitRange`: what is being bisected
//! - `BisectRequest`: what the caller asked for
//! - `TestRun` / `CommitRun` / `BisectionExecution`: what was observed

pub mod commit;
pub mod digest;
pub mod error;
pub mod request;
pub mod run;

pub use commit::{hash_matches, CombinedCommit, Commit, CommitRange};
pub use error::{BisectError, Result};
pub use request::{BisectRequest, DEFAULT_REPOSITORY};
pub use run::{AggregationMethod, BisectionExecution, CommitRun, TestRun};
