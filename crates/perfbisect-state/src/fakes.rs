//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryJobLedger`, which satisfies the [`JobLedger`] contract
//! without any external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug)]
struct JobState {
    record: JobRecord,
    steps: Vec<StepEvent>,
}

/// In-memory job ledger backed by a `HashMap<JobId, JobState>`.
#[derive(Debug, Default)]
pub struct MemoryJobLedger {
    jobs: Mutex<HashMap<String, JobState>>,
}

impl MemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_running<T>(
        &self,
        job_id: &JobId,
        f: impl FnOnce(&mut JobState) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let state = jobs
            .get_mut(&job_id.0)
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;
        if state.record.status != JobStatus::Running {
            return Err(StorageError::InvalidJobState {
                job_id: job_id.0.clone(),
                status: state.record.status.to_string(),
                expected: JobStatus::Running.to_string(),
            });
        }
        f(state)
    }
}

#[async_trait]
impl JobLedger for MemoryJobLedger {
    async fn create_job(
        &self,
        job_id: &JobId,
        request_digest: &ContentDigest,
        metadata: JobMetadata,
    ) -> StorageResult<()> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if jobs.contains_key(&job_id.0) {
            return Err(StorageError::DuplicateJob {
                job_id: job_id.0.clone(),
            });
        }
        let record = JobRecord {
            job_id: job_id.clone(),
            request_digest: request_digest.clone(),
            metadata,
            status: JobStatus::Running,
            culprit: None,
            error: None,
            total_steps: 0,
            duration_ms: 0,
            created_at: Utc::now(),
            completed_at: None,
        };
        jobs.insert(
            job_id.0.clone(),
            JobState {
                record,
                steps: Vec::new(),
            },
        );
        Ok(())
    }

    async fn append_step(&self, job_id: &JobId, step: StepEvent) -> StorageResult<()> {
        self.with_running(job_id, |state| {
            if state.steps.iter().any(|s| s.seq == step.seq) {
                return Err(StorageError::DuplicateStep {
                    job_id: job_id.0.clone(),
                    seq: step.seq,
                });
            }
            state.steps.push(step);
            state.record.total_steps = state.steps.len() as u64;
            Ok(())
        })
    }

    async fn complete_job(&self, job_id: &JobId, outcome: JobOutcome) -> StorageResult<()> {
        self.with_running(job_id, |state| {
            state.record.status = JobStatus::Completed;
            state.record.culprit = outcome.culprit;
            state.record.total_steps = outcome.total_steps;
            state.record.duration_ms = outcome.duration_ms;
            state.record.completed_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn fail_job(&self, job_id: &JobId, error: &str, total_steps: u64) -> StorageResult<()> {
        self.with_running(job_id, |state| {
            state.record.status = JobStatus::Failed;
            state.record.error = Some(error.to_string());
            state.record.total_steps = total_steps;
            state.record.completed_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn cancel_job(&self, job_id: &JobId) -> StorageResult<()> {
        self.with_running(job_id, |state| {
            state.record.status = JobStatus::Cancelled;
            state.record.completed_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn get_job(&self, job_id: &JobId) -> StorageResult<JobRecord> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        jobs.get(&job_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })
    }

    async fn get_steps(&self, job_id: &JobId) -> StorageResult<Vec<StepEvent>> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let state = jobs
            .get(&job_id.0)
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;
        let mut steps = state.steps.clone();
        steps.sort_by_key(|s| s.seq);
        Ok(steps)
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> StorageResult<Vec<JobRecord>> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut records: Vec<JobRecord> = jobs
            .values()
            .filter(|s| status.map(|st| s.record.status == st).unwrap_or(true))
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
