//! SurrealDB-backed JobLedger implementation
//!
//! Uses `schema::JobRow` and `schema::StepRow` for persistence,
//! converting to/from `storage_traits` types at the boundary.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::debug;

use crate::error::StorageError;
use crate::handle;
use crate::schema::{JobRow, StepRow};
use crate::storage_traits::{
    ContentDigest, CulpritRef, JobId, JobLedger, JobMetadata, JobOutcome, JobRecord, JobStatus,
    StepEvent, StorageResult,
};

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed implementation of [`JobLedger`].
pub struct SurrealJobLedger {
    db: Surreal<Any>,
}

impl SurrealJobLedger {
    /// Wrap an already-migrated connection.
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(handle::connect_memory().await?))
    }

    /// Create from environment variables (see [`handle::connect_from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        Ok(Self::new(handle::connect_from_env().await?))
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_job(&self, jid: &str) -> StorageResult<JobRow> {
        let mut res = self
            .db
            .query("SELECT * FROM bisect_jobs WHERE job_id = $jid")
            .bind(("jid", jid.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<JobRow> = res.take(0).map_err(backend)?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: jid.to_string(),
            })
    }

    async fn fetch_running(&self, jid: &str) -> StorageResult<JobRow> {
        let row = self.fetch_job(jid).await?;
        if row.status != JobStatus::Running.as_str() {
            return Err(StorageError::InvalidJobState {
                job_id: jid.to_string(),
                status: row.status,
                expected: JobStatus::Running.to_string(),
            });
        }
        Ok(row)
    }

    fn row_to_record(row: JobRow) -> StorageResult<JobRecord> {
        let status: JobStatus = row.status.parse()?;
        let culprit = match (row.culprit_repository_url, row.culprit_git_hash) {
            (Some(repository_url), Some(git_hash)) => Some(CulpritRef {
                repository_url,
                git_hash,
            }),
            _ => None,
        };

        Ok(JobRecord {
            job_id: JobId(row.job_id),
            request_digest: ContentDigest::try_from(row.request_digest)?,
            metadata: JobMetadata {
                benchmark: row.benchmark,
                story: row.story,
                chart: row.chart,
                request: row.request,
            },
            status,
            culprit,
            error: row.error,
            total_steps: row.total_steps,
            duration_ms: row.duration_ms,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }

    fn row_to_step(row: StepRow) -> StepEvent {
        StepEvent {
            seq: row.seq,
            kind: row.kind,
            payload: row.payload,
            timestamp: row.timestamp,
        }
    }

    async fn finish(
        &self,
        job_id: &JobId,
        status: JobStatus,
        set_clause: &str,
        binds: Vec<(&'static str, serde_json::Value)>,
    ) -> StorageResult<()> {
        self.fetch_running(&job_id.0).await?;

        let sql = format!(
            "UPDATE bisect_jobs SET status = $status, completed_at = time::now(){set_clause} \
             WHERE job_id = $jid"
        );
        let mut query = self
            .db
            .query(sql)
            .bind(("status", status.as_str().to_string()))
            .bind(("jid", job_id.0.clone()));
        for bind in binds {
            query = query.bind(bind);
        }
        query.await.map_err(backend)?;
        debug!(job_id = %job_id, status = %status, "job finished");
        Ok(())
    }
}

#[async_trait]
impl JobLedger for SurrealJobLedger {
    async fn create_job(
        &self,
        job_id: &JobId,
        request_digest: &ContentDigest,
        metadata: JobMetadata,
    ) -> StorageResult<()> {
        if self.fetch_job(&job_id.0).await.is_ok() {
            return Err(StorageError::DuplicateJob {
                job_id: job_id.0.clone(),
            });
        }

        let row = JobRow::new(
            job_id.0.clone(),
            request_digest.as_str().to_string(),
            metadata.benchmark,
            metadata.story,
            metadata.chart,
            metadata.request,
        );

        debug!(job_id = %job_id, "creating job");

        let _created: Option<JobRow> = self
            .db
            .create("bisect_jobs")
            .content(row)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn append_step(&self, job_id: &JobId, step: StepEvent) -> StorageResult<()> {
        self.fetch_running(&job_id.0).await?;

        let mut res = self
            .db
            .query("SELECT * FROM bisect_steps WHERE job_id = $jid AND seq = $seq")
            .bind(("jid", job_id.0.clone()))
            .bind(("seq", step.seq))
            .await
            .map_err(backend)?;
        let existing: Vec<StepRow> = res.take(0).map_err(backend)?;
        if !existing.is_empty() {
            return Err(StorageError::DuplicateStep {
                job_id: job_id.0.clone(),
                seq: step.seq,
            });
        }

        let row = StepRow::new(job_id.0.clone(), step.seq, step.kind, step.payload, step.timestamp);
        let _created: Option<StepRow> = self
            .db
            .create("bisect_steps")
            .content(row)
            .await
            .map_err(backend)?;

        self.db
            .query("UPDATE bisect_jobs SET total_steps += 1 WHERE job_id = $jid")
            .bind(("jid", job_id.0.clone()))
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn complete_job(&self, job_id: &JobId, outcome: JobOutcome) -> StorageResult<()> {
        let (url, hash) = match outcome.culprit {
            Some(c) => (
                serde_json::Value::String(c.repository_url),
                serde_json::Value::String(c.git_hash),
            ),
            None => (serde_json::Value::Null, serde_json::Value::Null),
        };
        self.finish(
            job_id,
            JobStatus::Completed,
            ", culprit_repository_url = $url, culprit_git_hash = $hash, \
             total_steps = $steps, duration_ms = $duration",
            vec![
                ("url", url),
                ("hash", hash),
                ("steps", serde_json::json!(outcome.total_steps)),
                ("duration", serde_json::json!(outcome.duration_ms)),
            ],
        )
        .await
    }

    async fn fail_job(&self, job_id: &JobId, error: &str, total_steps: u64) -> StorageResult<()> {
        self.finish(
            job_id,
            JobStatus::Failed,
            ", error = $error, total_steps = $steps",
            vec![
                ("error", serde_json::Value::String(error.to_string())),
                ("steps", serde_json::json!(total_steps)),
            ],
        )
        .await
    }

    async fn cancel_job(&self, job_id: &JobId) -> StorageResult<()> {
        self.finish(job_id, JobStatus::Cancelled, "", Vec::new())
            .await
    }

    async fn get_job(&self, job_id: &JobId) -> StorageResult<JobRecord> {
        let row = self.fetch_job(&job_id.0).await?;
        Self::row_to_record(row)
    }

    async fn get_steps(&self, job_id: &JobId) -> StorageResult<Vec<StepEvent>> {
        self.fetch_job(&job_id.0).await?;

        let mut res = self
            .db
            .query("SELECT * FROM bisect_steps WHERE job_id = $jid ORDER BY seq ASC")
            .bind(("jid", job_id.0.clone()))
            .await
            .map_err(backend)?;

        let rows: Vec<StepRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().map(Self::row_to_step).collect())
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> StorageResult<Vec<JobRecord>> {
        let rows: Vec<JobRow> = if let Some(status) = status {
            let mut res = self
                .db
                .query("SELECT * FROM bisect_jobs WHERE status = $status ORDER BY created_at DESC")
                .bind(("status", status.as_str().to_string()))
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM bisect_jobs ORDER BY created_at DESC")
                .await
                .map_err(backend)?;
            res.take(0).map_err(backend)?
        };

        rows.into_iter().map(Self::row_to_record).collect()
    }
}
