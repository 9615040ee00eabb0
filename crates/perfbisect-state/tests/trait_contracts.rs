//! Trait contract tests for JobLedger.
//!
//! Each contract runs against both the in-memory fake and the SurrealDB
//! ledger (in `mem://` mode). Any conforming implementation must pass these.

use chrono::Utc;
use perfbisect_state::fakes::MemoryJobLedger;
use perfbisect_state::storage_traits::*;
use perfbisect_state::{StorageError, SurrealJobLedger};

fn metadata() -> JobMetadata {
    JobMetadata {
        benchmark: "speedometer3".to_string(),
        story: "Speedometer3".to_string(),
        chart: "Score".to_string(),
        request: serde_json::json!({"start_git_hash": "aaa", "end_git_hash": "bbb"}),
    }
}

fn digest() -> ContentDigest {
    ContentDigest::from_bytes(b"{\"start_git_hash\":\"aaa\"}")
}

fn step(seq: u64, kind: &str) -> StepEvent {
    StepEvent {
        seq,
        kind: kind.to_string(),
        payload: serde_json::json!({"seq": seq}),
        timestamp: Utc::now(),
    }
}

async fn ledgers() -> Vec<(&'static str, Box<dyn JobLedger>)> {
    vec![
        ("memory", Box::new(MemoryJobLedger::new())),
        (
            "surreal",
            Box::new(SurrealJobLedger::in_memory().await.unwrap()),
        ),
    ]
}

#[tokio::test]
async fn create_then_get_returns_running_job() {
    for (name, ledger) in ledgers().await {
        let id = JobId::new();
        ledger.create_job(&id, &digest(), metadata()).await.unwrap();

        let record = ledger.get_job(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Running, "{name}");
        assert_eq!(record.request_digest, digest(), "{name}");
        assert_eq!(record.metadata, metadata(), "{name}");
        assert!(record.completed_at.is_none(), "{name}");
    }
}

#[tokio::test]
async fn duplicate_job_is_rejected() {
    for (name, ledger) in ledgers().await {
        let id = JobId::from("dup-job");
        ledger.create_job(&id, &digest(), metadata()).await.unwrap();
        let err = ledger
            .create_job(&id, &digest(), metadata())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateJob { .. }), "{name}");
    }
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    for (name, ledger) in ledgers().await {
        let err = ledger.get_job(&JobId::from("missing")).await.unwrap_err();
        assert!(matches!(err, StorageError::JobNotFound { .. }), "{name}");
    }
}

#[tokio::test]
async fn steps_come_back_in_seq_order() {
    for (name, ledger) in ledgers().await {
        let id = JobId::new();
        ledger.create_job(&id, &digest(), metadata()).await.unwrap();
        ledger.append_step(&id, step(1, "run_commit")).await.unwrap();
        ledger.append_step(&id, step(2, "run_commit")).await.unwrap();
        ledger.append_step(&id, step(3, "compare")).await.unwrap();

        let steps = ledger.get_steps(&id).await.unwrap();
        let seqs: Vec<u64> = steps.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3], "{name}");
        assert_eq!(steps[2].kind, "compare", "{name}");
        assert_eq!(ledger.get_job(&id).await.unwrap().total_steps, 3, "{name}");
    }
}

#[tokio::test]
async fn duplicate_step_seq_is_rejected() {
    for (name, ledger) in ledgers().await {
        let id = JobId::new();
        ledger.create_job(&id, &digest(), metadata()).await.unwrap();
        ledger.append_step(&id, step(1, "run_commit")).await.unwrap();
        let err = ledger
            .append_step(&id, step(1, "run_commit"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::DuplicateStep { seq: 1, .. }),
            "{name}"
        );
    }
}

#[tokio::test]
async fn complete_records_culprit() {
    for (name, ledger) in ledgers().await {
        let id = JobId::new();
        ledger.create_job(&id, &digest(), metadata()).await.unwrap();
        ledger
            .complete_job(
                &id,
                JobOutcome {
                    culprit: Some(CulpritRef {
                        repository_url: "https://chromium.googlesource.com/chromium/src"
                            .to_string(),
                        git_hash: "c5".to_string(),
                    }),
                    total_steps: 7,
                    duration_ms: 1200,
                },
            )
            .await
            .unwrap();

        let record = ledger.get_job(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed, "{name}");
        assert_eq!(record.culprit.unwrap().git_hash, "c5", "{name}");
        assert_eq!(record.duration_ms, 1200, "{name}");
        assert!(record.completed_at.is_some(), "{name}");
    }
}

#[tokio::test]
async fn terminal_jobs_reject_further_writes() {
    for (name, ledger) in ledgers().await {
        let id = JobId::new();
        ledger.create_job(&id, &digest(), metadata()).await.unwrap();
        ledger.cancel_job(&id).await.unwrap();

        let err = ledger
            .append_step(&id, step(1, "run_commit"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::InvalidJobState { .. }),
            "{name}"
        );
        let err = ledger.fail_job(&id, "late", 0).await.unwrap_err();
        assert!(
            matches!(err, StorageError::InvalidJobState { .. }),
            "{name}"
        );
        assert_eq!(
            ledger.get_job(&id).await.unwrap().status,
            JobStatus::Cancelled,
            "{name}"
        );
    }
}

#[tokio::test]
async fn fail_records_error_message() {
    for (name, ledger) in ledgers().await {
        let id = JobId::new();
        ledger.create_job(&id, &digest(), metadata()).await.unwrap();
        ledger.fail_job(&id, "polling failed", 4).await.unwrap();

        let record = ledger.get_job(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed, "{name}");
        assert_eq!(record.error.as_deref(), Some("polling failed"), "{name}");
        assert_eq!(record.total_steps, 4, "{name}");
    }
}

#[tokio::test]
async fn list_jobs_filters_by_status() {
    for (name, ledger) in ledgers().await {
        let running = JobId::new();
        let done = JobId::new();
        ledger
            .create_job(&running, &digest(), metadata())
            .await
            .unwrap();
        ledger.create_job(&done, &digest(), metadata()).await.unwrap();
        ledger
            .complete_job(
                &done,
                JobOutcome {
                    culprit: None,
                    total_steps: 0,
                    duration_ms: 0,
                },
            )
            .await
            .unwrap();

        let all = ledger.list_jobs(None).await.unwrap();
        assert_eq!(all.len(), 2, "{name}");

        let still_running = ledger.list_jobs(Some(JobStatus::Running)).await.unwrap();
        assert_eq!(still_running.len(), 1, "{name}");
        assert_eq!(still_running[0].job_id, running, "{name}");
    }
}
