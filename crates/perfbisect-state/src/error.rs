//! Error types for perfbisect-state

use thiserror::Error;

/// Errors raised while connecting to or migrating the database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors surfaced through the [`crate::JobLedger`] trait.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("job already exists: {job_id}")]
    DuplicateJob { job_id: String },

    #[error("job {job_id} already has a step with seq {seq}")]
    DuplicateStep { job_id: String, seq: u64 },

    #[error("job {job_id} is {status}, expected {expected}")]
    InvalidJobState {
        job_id: String,
        status: String,
        expected: String,
    },

    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
