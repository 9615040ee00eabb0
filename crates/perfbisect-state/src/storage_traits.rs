//! Storage trait definitions for perfbisect
//!
//! A bisection job is persisted as a [`JobRecord`] plus an ordered journal of
//! [`StepEvent`]s. The journal is what makes a long-running bisection
//! replayable: every non-deterministic step appends its observed result, and
//! a restarted job re-reads those results instead of re-executing them.
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// JobLedger
// ---------------------------------------------------------------------------

/// Unique identifier for a bisection job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random JobId
    pub fn new() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

/// Metadata attached to a job at creation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Benchmark under test
    pub benchmark: String,
    /// Story within the benchmark
    pub story: String,
    /// Chart (metric) the bisection compares
    pub chart: String,
    /// The full request, kept so the job can be resumed after a restart
    pub request: serde_json::Value,
}

/// A single journaled step of a bisection job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    /// Monotonic sequence number within the job (1-indexed)
    pub seq: u64,
    /// Step kind (e.g. "run_commit", "find_mid_commit", "compare")
    pub kind: String,
    /// Observed result of the step
    pub payload: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// The commit a finished job blamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CulpritRef {
    pub repository_url: String,
    pub git_hash: String,
}

/// Produced when a job terminates normally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// `None` when the range showed no localizable regression
    pub culprit: Option<CulpritRef>,
    /// Total steps journaled
    pub total_steps: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

/// Status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(StorageError::Backend(format!("unknown job status: {other}"))),
        }
    }
}

/// Full job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub request_digest: ContentDigest,
    pub metadata: JobMetadata,
    pub status: JobStatus,
    pub culprit: Option<CulpritRef>,
    pub error: Option<String>,
    pub total_steps: u64,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Bisection job ledger.
///
/// Guarantees:
/// - Steps are ordered by monotonic `seq` within a job; a seq is written once.
/// - A job transitions: Running → Completed | Failed | Cancelled (terminal).
/// - Terminal jobs are immutable and reject further steps.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Register a new job in `Running` state. Fails if the id is taken.
    async fn create_job(
        &self,
        job_id: &JobId,
        request_digest: &ContentDigest,
        metadata: JobMetadata,
    ) -> StorageResult<()>;

    /// Append a step to a running job.
    async fn append_step(&self, job_id: &JobId, step: StepEvent) -> StorageResult<()>;

    /// Mark a job as completed with its outcome.
    async fn complete_job(&self, job_id: &JobId, outcome: JobOutcome) -> StorageResult<()>;

    /// Mark a job as failed, keeping the error text for diagnosis.
    async fn fail_job(&self, job_id: &JobId, error: &str, total_steps: u64) -> StorageResult<()>;

    /// Mark a job as cancelled.
    async fn cancel_job(&self, job_id: &JobId) -> StorageResult<()>;

    /// Retrieve a job record by ID.
    async fn get_job(&self, job_id: &JobId) -> StorageResult<JobRecord>;

    /// Retrieve all steps for a job, ordered by seq.
    async fn get_steps(&self, job_id: &JobId) -> StorageResult<Vec<StepEvent>>;

    /// List jobs, newest first, optionally filtered by status.
    async fn list_jobs(&self, status: Option<JobStatus>) -> StorageResult<Vec<JobRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_short_is_prefix() {
        let a = ContentDigest::from_bytes(b"request");
        let b = ContentDigest::from_bytes(b"request");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().starts_with(a.short()));
    }

    #[test]
    fn digest_rejects_non_hex() {
        let err = ContentDigest::try_from("xyz".to_string()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidDigest { .. }));
    }

    #[test]
    fn job_status_round_trips_through_str() {
        for status in [
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
