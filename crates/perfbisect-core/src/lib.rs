//! perfbisect core library
//!
//! Finds the commit responsible for a benchmark regression between two
//! revisions, descending into rolled dependencies when two adjacent commits
//! differ only by a dependency pin.

pub mod commit_runner;
pub mod compare;
pub mod config;
pub mod deps;
pub mod domain;
pub mod fakes;
pub mod fleet;
pub mod gitiles;
pub mod journal;
pub mod metrics;
pub mod midpoint;
pub mod obs;
pub mod run_benchmark;
pub mod samples;
pub mod service;
pub mod source;
pub mod swarming;
pub mod telemetry;
pub mod workflow;

pub use domain::{
    hash_matches, AggregationMethod, BisectError, BisectRequest, BisectionExecution,
    CombinedCommit, Commit, CommitRange, CommitRun, Result, TestRun, DEFAULT_REPOSITORY,
};

pub use commit_runner::{CommitRunner, RunSettings};
pub use compare::{compare, ComparisonResult, Verdict};
pub use config::{BisectConfig, BENCHMARK_RUN_ITERATIONS};
pub use deps::{fetch_git_deps, parse_deps, DependencyManifest};
pub use fleet::{CasReference, FleetClient, TaskParams, TaskRequest, TaskState};
pub use gitiles::{gitiles_provider, GitilesRepo};
pub use journal::StepJournal;
pub use midpoint::{DependencyRoll, MidpointResolver, RangeStep};
pub use run_benchmark::BenchmarkRunner;
pub use samples::{BuildProvider, ManifestBuilds, ResultReader, ResultsDir};
pub use service::{BisectionReport, BisectionService};
pub use source::{CachingRepoProvider, CommitInfo, RepoProvider, SourceRepo};
pub use swarming::SwarmingClient;
pub use workflow::BisectWorkflow;

pub use metrics::METRICS;
pub use obs::{Heartbeat, JobSpan, TracingHeartbeat};
pub use telemetry::init_tracing;

/// perfbisect version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
