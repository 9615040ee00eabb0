//! SurrealDB row types for the job ledger.
//!
//! These are the on-disk shapes. [`crate::surreal_ledger`] converts them
//! to and from the `storage_traits` types at the boundary.

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bisection job row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    /// Unique job ID (UUID string)
    pub job_id: String,
    /// SHA-256 of the canonical request JSON
    pub request_digest: String,
    pub benchmark: String,
    pub story: String,
    pub chart: String,
    /// Full request (JSON)
    pub request: serde_json::Value,
    /// Job status: "running" | "completed" | "failed" | "cancelled"
    pub status: String,
    pub culprit_repository_url: Option<String>,
    pub culprit_git_hash: Option<String>,
    pub error: Option<String>,
    pub total_steps: u64,
    pub duration_ms: u64,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    /// Create a new job row in "running" state
    pub fn new(
        job_id: String,
        request_digest: String,
        benchmark: String,
        story: String,
        chart: String,
        request: serde_json::Value,
    ) -> Self {
        JobRow {
            id: None,
            job_id,
            request_digest,
            benchmark,
            story,
            chart,
            request,
            status: "running".to_string(),
            culprit_repository_url: None,
            culprit_git_hash: None,
            error: None,
            total_steps: 0,
            duration_ms: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Journaled step row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    /// Job this step belongs to
    pub job_id: String,
    /// Monotonic sequence number within the job (1-indexed)
    pub seq: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}

impl StepRow {
    pub fn new(
        job_id: String,
        seq: u64,
        kind: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        StepRow {
            id: None,
            job_id,
            seq,
            kind,
            payload,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_row_starts_running() {
        let row = JobRow::new(
            "job-1".to_string(),
            "digest".to_string(),
            "speedometer3".to_string(),
            "Speedometer3".to_string(),
            "Score".to_string(),
            serde_json::json!({"start_git_hash": "a"}),
        );
        assert_eq!(row.status, "running");
        assert_eq!(row.total_steps, 0);
        assert!(row.completed_at.is_none());

        let json = serde_json::to_string(&row).expect("serialize");
        assert!(json.contains("job-1"));
        assert!(json.contains("speedometer3"));
    }

    #[test]
    fn test_step_row_serialization() {
        let row = StepRow::new(
            "job-1".to_string(),
            3,
            "compare".to_string(),
            serde_json::json!({"verdict": "different"}),
            Utc::now(),
        );
        let json = serde_json::to_string(&row).expect("serialize");
        assert!(json.contains("\"seq\":3"));
        assert!(json.contains("compare"));
    }
}
