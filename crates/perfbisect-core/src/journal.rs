//! Step journal: memoizes a job's non-deterministic steps in a [`JobLedger`].
//!
//! Each step gets the next sequence number when it is created. On a fresh
//! run the step executes and its result is appended to the ledger; on a
//! resumed run a step whose seq is already journaled returns the stored
//! result without executing. The control loop is a pure function of step
//! results, so replaying the journal brings it back to where it stopped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use perfbisect_state::{JobId, JobLedger, StepEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::{BisectError, Result};
use crate::metrics::METRICS;
use crate::obs;

pub const STEP_RUN_COMMIT: &str = "run_commit";
pub const STEP_FIND_MID_COMMIT: &str = "find_mid_commit";
pub const STEP_COMPARE: &str = "compare";

/// Journal bound to one job.
pub struct StepJournal {
    ledger: Arc<dyn JobLedger>,
    job_id: JobId,
    recorded: HashMap<u64, StepEvent>,
    next_seq: AtomicU64,
}

impl StepJournal {
    /// Load the steps already journaled for `job_id`.
    pub async fn open(ledger: Arc<dyn JobLedger>, job_id: JobId) -> Result<Self> {
        let steps = ledger.get_steps(&job_id).await?;
        let recorded = steps.into_iter().map(|s| (s.seq, s)).collect();
        Ok(Self {
            ledger,
            job_id,
            recorded,
            next_seq: AtomicU64::new(1),
        })
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Steps available for replay.
    pub fn replayable(&self) -> usize {
        self.recorded.len()
    }

    /// Steps issued so far, replayed or executed.
    pub fn steps_taken(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    /// Run `step` as journal step `kind`, or replay its stored result.
    ///
    /// The seq is claimed here rather than when the returned future is
    /// polled, so steps created together (e.g. joined endpoint runs) keep
    /// the same numbering on every replay.
    pub fn record<'a, T, Fut>(&'a self, kind: &'static str, step: Fut) -> impl Future<Output = Result<T>> + 'a
    where
        T: Serialize + DeserializeOwned + 'a,
        Fut: Future<Output = Result<T>> + 'a,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        async move {
            if let Some(event) = self.recorded.get(&seq) {
                if event.kind != kind {
                    return Err(BisectError::JournalMismatch {
                        job_id: self.job_id.0.clone(),
                        seq,
                        reason: format!("expected {kind}, journal has {}", event.kind),
                    });
                }
                let value = serde_json::from_value(event.payload.clone())?;
                METRICS.inc_steps_replayed();
                obs::emit_step_replayed(&self.job_id.0, seq, kind);
                return Ok(value);
            }

            let value = step.await?;
            let event = StepEvent {
                seq,
                kind: kind.to_string(),
                payload: serde_json::to_value(&value)?,
                timestamp: Utc::now(),
            };
            self.ledger.append_step(&self.job_id, event).await?;
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfbisect_state::fakes::MemoryJobLedger;
    use perfbisect_state::{ContentDigest, JobMetadata};
    use std::sync::atomic::AtomicUsize;

    async fn ledger_with_job(job: &JobId) -> Arc<dyn JobLedger> {
        let ledger: Arc<dyn JobLedger> = Arc::new(MemoryJobLedger::new());
        let metadata = JobMetadata {
            benchmark: "speedometer2".to_string(),
            story: "Speedometer2".to_string(),
            chart: "Score".to_string(),
            request: serde_json::json!({}),
        };
        ledger
            .create_job(job, &ContentDigest::from_bytes(b"req"), metadata)
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn executes_then_replays_without_side_effects() {
        let job = JobId::from("job-replay");
        let ledger = ledger_with_job(&job).await;
        let calls = AtomicUsize::new(0);
        let step = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BisectError>(vec![1.0_f64, 2.0])
        };

        let first = StepJournal::open(ledger.clone(), job.clone()).await.unwrap();
        let v: Vec<f64> = first.record(STEP_RUN_COMMIT, step()).await.unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let resumed = StepJournal::open(ledger.clone(), job.clone()).await.unwrap();
        assert_eq!(resumed.replayable(), 1);
        let v: Vec<f64> = resumed.record(STEP_RUN_COMMIT, step()).await.unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Past the journal, steps execute again and append.
        let _: Vec<f64> = resumed.record(STEP_COMPARE, step()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.get_steps(&job).await.unwrap().len(), 2);
        assert_eq!(resumed.steps_taken(), 2);
    }

    #[tokio::test]
    async fn kind_mismatch_is_rejected() {
        let job = JobId::from("job-mismatch");
        let ledger = ledger_with_job(&job).await;
        let first = StepJournal::open(ledger.clone(), job.clone()).await.unwrap();
        first
            .record(STEP_COMPARE, async { Ok::<_, BisectError>(true) })
            .await
            .unwrap();

        let resumed = StepJournal::open(ledger, job).await.unwrap();
        let err = resumed
            .record(STEP_RUN_COMMIT, async { Ok::<_, BisectError>(true) })
            .await
            .unwrap_err();
        assert!(matches!(err, BisectError::JournalMismatch { seq: 1, .. }));
    }

    #[tokio::test]
    async fn seq_is_claimed_at_creation() {
        let job = JobId::from("job-order");
        let ledger = ledger_with_job(&job).await;
        let journal = StepJournal::open(ledger.clone(), job.clone()).await.unwrap();

        let a = journal.record(STEP_RUN_COMMIT, async { Ok::<_, BisectError>("a".to_string()) });
        let b = journal.record(STEP_RUN_COMMIT, async { Ok::<_, BisectError>("b".to_string()) });
        // Completing b first must not steal seq 1.
        b.await.unwrap();
        a.await.unwrap();

        let steps = ledger.get_steps(&job).await.unwrap();
        assert_eq!(steps[0].payload, serde_json::json!("a"));
        assert_eq!(steps[1].payload, serde_json::json!("b"));
    }

    #[tokio::test]
    async fn failed_steps_are_not_journaled() {
        let job = JobId::from("job-fail");
        let ledger = ledger_with_job(&job).await;
        let journal = StepJournal::open(ledger.clone(), job.clone()).await.unwrap();
        let err = journal
            .record(STEP_RUN_COMMIT, async { Err::<u32, _>(BisectError::Cancelled) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(ledger.get_steps(&job).await.unwrap().is_empty());
    }
}
