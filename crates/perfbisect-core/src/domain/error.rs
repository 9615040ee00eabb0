//! Error taxonomy for the bisection engine.
//!
//! Every variant carries the commit, task or step context needed to
//! diagnose a failed bisection. None of them are retried by the control
//! loop; the only local retries live in the benchmark activity
//! (no-resource rescheduling and poll failures).

use perfbisect_state::StorageError;

/// Errors produced while bisecting.
#[derive(Debug, thiserror::Error)]
pub enum BisectError {
    #[error("invalid range in {repository_url}: start and end are both {revision}")]
    InvalidRange {
        repository_url: String,
        revision: String,
    },

    #[error("commits are from different repositories: {start_repository} vs {end_repository}")]
    CrossRepository {
        start_repository: String,
        end_repository: String,
    },

    #[error(
        "source control returned no commits for {repository_url} {start}..{end}; \
         the hashes may be reversed"
    )]
    EmptyHistory {
        repository_url: String,
        start: String,
        end: String,
    },

    #[error("failed to fetch {path} at {repository_url}@{revision}: {reason}")]
    ManifestFetch {
        repository_url: String,
        revision: String,
        path: String,
        reason: String,
    },

    #[error("failed to parse dependency manifest at {repository_url}@{revision}: {reason}")]
    ManifestParse {
        repository_url: String,
        revision: String,
        reason: String,
    },

    #[error("{dependency} doesn't exist in DEPS at {repository_url}@{revision}")]
    DependencyNotFound {
        repository_url: String,
        revision: String,
        dependency: String,
    },

    #[error("override for {repository_url} conflicts with an existing commit in the combined commit")]
    DuplicateOverride { repository_url: String },

    #[error("failed to schedule benchmark for {commit} (attempt {attempt}): {reason}")]
    Scheduling {
        commit: String,
        attempt: u32,
        reason: String,
    },

    #[error("no bot available to run the task: {reason}")]
    NoResource { reason: String },

    #[error("failed to poll task {task_id} after {attempts} attempts: {reason}")]
    Polling {
        task_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("source control error for {repository_url}: {reason}")]
    SourceControl {
        repository_url: String,
        reason: String,
    },

    #[error("fleet error during {operation}: {reason}")]
    Fleet { operation: String, reason: String },

    #[error("no build available for {commit}: {reason}")]
    Build { commit: String, reason: String },

    #[error("failed to read results for {chart} from {digest}: {reason}")]
    Results {
        digest: String,
        chart: String,
        reason: String,
    },

    #[error("comparison failed: {0}")]
    Comparison(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("journal mismatch for job {job_id} at step {seq}: {reason}")]
    JournalMismatch {
        job_id: String,
        seq: u64,
        reason: String,
    },

    #[error("bisection cancelled")]
    Cancelled,

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BisectError {
    /// True for the cancellation signal, which is reported rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BisectError::Cancelled)
    }
}

/// Result type for bisection operations.
pub type Result<T> = std::result::Result<T, BisectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_range_mentions_revision() {
        let err = BisectError::InvalidRange {
            repository_url: "https://chromium.googlesource.com/chromium/src".to_string(),
            revision: "abc123".to_string(),
        };
        assert!(err.to_string().contains("abc123"));
    }

    #[test]
    fn test_polling_error_carries_task_context() {
        let err = BisectError::Polling {
            task_id: "task-7".to_string(),
            attempts: 5,
            reason: "503".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("task-7"));
        assert!(msg.contains("5 attempts"));
    }

    #[test]
    fn test_storage_error_converts() {
        let err: BisectError = StorageError::JobNotFound {
            job_id: "j1".to_string(),
        }
        .into();
        assert!(matches!(err, BisectError::Storage(_)));
        assert!(!err.is_cancelled());
        assert!(BisectError::Cancelled.is_cancelled());
    }
}
