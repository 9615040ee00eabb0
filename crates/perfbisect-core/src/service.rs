//! Job service: schedule, query, cancel and resume bisections.
//!
//! Each scheduled job runs as its own tokio task with its own
//! [`CancellationToken`]. The ledger is the source of truth for job state;
//! the in-process table only tracks what this process is driving.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use perfbisect_state::{
    CulpritRef, JobId, JobLedger, JobMetadata, JobOutcome, JobRecord, JobStatus, StorageError,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Instrument};

use crate::domain::digest::digest_of;
use crate::domain::{BisectError, BisectRequest, BisectionExecution, Commit, Result};
use crate::journal::StepJournal;
use crate::metrics::METRICS;
use crate::obs::{self, JobSpan};
use crate::workflow::BisectWorkflow;

/// A job as seen through [`BisectionService::query_bisection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BisectionReport {
    pub execution: BisectionExecution,
    pub status: JobStatus,
    pub error: Option<String>,
    pub total_steps: u64,
    pub duration_ms: u64,
}

impl From<JobRecord> for BisectionReport {
    fn from(record: JobRecord) -> Self {
        Self {
            execution: BisectionExecution {
                job_id: record.job_id.0,
                culprit: record
                    .culprit
                    .map(|c| Commit::new(c.repository_url, c.git_hash)),
            },
            status: record.status,
            error: record.error,
            total_steps: record.total_steps,
            duration_ms: record.duration_ms,
        }
    }
}

struct LiveJob {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

type LiveJobs = Mutex<HashMap<String, LiveJob>>;

fn lock_live(live: &LiveJobs) -> MutexGuard<'_, HashMap<String, LiveJob>> {
    live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct BisectionService {
    ledger: Arc<dyn JobLedger>,
    workflow: Arc<BisectWorkflow>,
    /// Jobs this process is driving. A job leaves the table when its task ends.
    live: Arc<LiveJobs>,
}

impl BisectionService {
    pub fn new(ledger: Arc<dyn JobLedger>, workflow: Arc<BisectWorkflow>) -> Self {
        Self {
            ledger,
            workflow,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, LiveJob>> {
        lock_live(&self.live)
    }

    /// Number of jobs this process is currently driving.
    pub fn live_job_count(&self) -> usize {
        self.live().len()
    }

    /// Validate `request`, record the job and start bisecting in the
    /// background.
    pub async fn schedule_bisection(&self, request: BisectRequest) -> Result<JobId> {
        request.validate()?;
        let job_id = JobId::new();
        let digest = digest_of(&request)?;
        let metadata = JobMetadata {
            benchmark: request.benchmark.clone(),
            story: request.story.clone(),
            chart: request.chart.clone(),
            request: serde_json::to_value(&request)?,
        };
        self.ledger.create_job(&job_id, &digest, metadata).await?;
        obs::emit_job_scheduled(
            &job_id.0,
            &request.benchmark,
            &request.start_git_hash,
            &request.end_git_hash,
        );
        self.spawn(job_id.clone(), request);
        Ok(job_id)
    }

    pub async fn query_bisection(&self, job_id: &JobId) -> Result<BisectionReport> {
        let record = self.ledger.get_job(job_id).await.map_err(|e| not_found(job_id, e))?;
        Ok(record.into())
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<BisectionReport>> {
        let records = self.ledger.list_jobs(status).await?;
        Ok(records.into_iter().map(BisectionReport::from).collect())
    }

    /// Cancel a job. Cancelling a job that already finished is a no-op.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        let record = self.ledger.get_job(job_id).await.map_err(|e| not_found(job_id, e))?;
        if record.status.is_terminal() {
            return Ok(());
        }
        let token = self.live().get(&job_id.0).map(|job| job.cancel.clone());
        if let Some(token) = token {
            token.cancel();
        }
        match self.ledger.cancel_job(job_id).await {
            Ok(()) => {
                obs::emit_job_cancelled(&job_id.0);
                Ok(())
            }
            Err(StorageError::InvalidJobState { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Restart every running job this process is not already driving,
    /// replaying its journal. Returns the resumed ids.
    pub async fn resume_incomplete(&self) -> Result<Vec<JobId>> {
        let running = self.ledger.list_jobs(Some(JobStatus::Running)).await?;
        let mut resumed = Vec::new();
        for record in running {
            if self.live().contains_key(&record.job_id.0) {
                continue;
            }
            let job_id = record.job_id.clone();
            let request: BisectRequest = match serde_json::from_value(record.metadata.request.clone()) {
                Ok(request) => request,
                Err(e) => {
                    self.abandon(&job_id, &BisectError::Serialization(e), record.total_steps)
                        .await?;
                    continue;
                }
            };
            let digest = digest_of(&request)?;
            if digest != record.request_digest {
                let err = BisectError::JournalMismatch {
                    job_id: job_id.0.clone(),
                    seq: 0,
                    reason: format!(
                        "request digest {} does not match recorded {}",
                        digest.short(),
                        record.request_digest.short()
                    ),
                };
                self.abandon(&job_id, &err, record.total_steps).await?;
                continue;
            }
            self.spawn(job_id.clone(), request);
            resumed.push(job_id);
        }
        Ok(resumed)
    }

    /// Wait for a job driven by this process to stop, then report it.
    pub async fn wait(&self, job_id: &JobId) -> Result<BisectionReport> {
        let handle = self
            .live()
            .get_mut(&job_id.0)
            .and_then(|job| job.handle.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(job_id = %job_id, error = %e, "job task did not finish cleanly");
            }
        }
        self.query_bisection(job_id).await
    }

    async fn abandon(&self, job_id: &JobId, error: &BisectError, total_steps: u64) -> Result<()> {
        obs::emit_job_failed(&job_id.0, error);
        match self.ledger.fail_job(job_id, &error.to_string(), total_steps).await {
            Ok(()) | Err(StorageError::InvalidJobState { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn spawn(&self, job_id: JobId, request: BisectRequest) {
        let cancel = CancellationToken::new();
        let span = JobSpan::span(&job_id.0);
        let live = Arc::clone(&self.live);
        let key = job_id.0.clone();
        let finished_key = key.clone();
        let job = drive(
            Arc::clone(&self.ledger),
            Arc::clone(&self.workflow),
            job_id,
            request,
            cancel.clone(),
        );
        // Held across spawn so the task cannot remove its entry before it exists.
        let mut table = self.live();
        let handle = tokio::spawn(
            async move {
                job.await;
                lock_live(&live).remove(&finished_key);
            }
            .instrument(span),
        );
        table.insert(
            key,
            LiveJob {
                cancel,
                handle: Some(handle),
            },
        );
    }
}

fn not_found(job_id: &JobId, e: StorageError) -> BisectError {
    match e {
        StorageError::JobNotFound { .. } => BisectError::JobNotFound(job_id.0.clone()),
        other => other.into(),
    }
}

/// Run one job to its end and record the outcome in the ledger.
async fn drive(
    ledger: Arc<dyn JobLedger>,
    workflow: Arc<BisectWorkflow>,
    job_id: JobId,
    request: BisectRequest,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let result = match StepJournal::open(Arc::clone(&ledger), job_id.clone()).await {
        Ok(journal) => {
            if journal.replayable() > 0 {
                obs::emit_job_resumed(&job_id.0, journal.replayable());
            }
            let result = workflow.run(&job_id.0, &request, &journal, &cancel).await;
            result.map(|execution| (execution, journal.steps_taken()))
        }
        Err(e) => Err(e),
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let settled = match result {
        Ok((execution, steps)) => {
            let culprit = execution.culprit.map(|c| CulpritRef {
                repository_url: c.repository_url,
                git_hash: c.git_hash,
            });
            let culprit_text = culprit
                .as_ref()
                .map(|c| format!("{}@{}", c.repository_url, c.git_hash));
            obs::emit_job_finished(&job_id.0, culprit_text.as_deref(), duration_ms, steps);
            METRICS.inc_jobs_finished();
            let outcome = JobOutcome {
                culprit,
                total_steps: steps,
                duration_ms,
            };
            ledger.complete_job(&job_id, outcome).await
        }
        Err(_) if cancel.is_cancelled() => ledger.cancel_job(&job_id).await,
        Err(e) => {
            obs::emit_job_failed(&job_id.0, &e);
            let steps = ledger.get_steps(&job_id).await.map(|s| s.len() as u64).unwrap_or(0);
            ledger.fail_job(&job_id, &e.to_string(), steps).await
        }
    };

    match settled {
        // Already settled elsewhere, e.g. cancelled through the ledger.
        Ok(()) | Err(StorageError::InvalidJobState { .. }) => {}
        Err(e) => warn!(job_id = %job_id, error = %e, "failed to record job outcome"),
    }
    METRICS.flush();
}
