//! Task lifecycle of `BenchmarkRunner` against the scripted fleet.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use perfbisect_core::fakes::FakeFleet;
use perfbisect_core::{BenchmarkRunner, BisectConfig, BisectError, CasReference, Heartbeat, TaskParams, TaskState};
use tokio_util::sync::CancellationToken;

fn params() -> TaskParams {
    TaskParams {
        job_id: "job-7".to_string(),
        commit_key: "0f0f0f0f0f0f".to_string(),
        bot_config: "linux-perf".to_string(),
        benchmark: "speedometer2".to_string(),
        story: "Speedometer2".to_string(),
        story_tags: None,
        build: CasReference::new("instance", "build-7", 64),
        pool: "chrome.tests.pinpoint".to_string(),
        bot_id: Some("build-bot-3".to_string()),
    }
}

fn config() -> BisectConfig {
    BisectConfig::default()
        .with_poll_interval(Duration::from_secs(10))
        .with_max_schedule_attempts(3)
        .with_max_poll_failures(5)
}

#[derive(Default)]
struct CountingHeartbeat {
    beats: AtomicUsize,
    details: Mutex<Vec<String>>,
}

impl Heartbeat for CountingHeartbeat {
    fn beat(&self, _task_id: &str, detail: &str) {
        self.beats.fetch_add(1, Ordering::SeqCst);
        self.details.lock().unwrap().push(detail.to_string());
    }
}

#[tokio::test(start_paused = true)]
async fn rejected_triggers_are_resubmitted_until_placed() {
    let fleet = Arc::new(FakeFleet::new().reject_next_triggers(2));
    let runner = BenchmarkRunner::new(fleet.clone(), config());

    let run = runner.run(params(), &CancellationToken::new()).await.unwrap();
    assert!(run.is_successful());
    assert_eq!(run.attempts, 3);
    assert_eq!(run.task_id, "task-1");

    let requests = fleet.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].dimensions.contains_key("id"));
    assert!(requests[1..].iter().all(|r| !r.dimensions.contains_key("id")));
}

#[tokio::test(start_paused = true)]
async fn rejected_triggers_past_budget_yield_no_resource_run() {
    let fleet = Arc::new(FakeFleet::new().reject_next_triggers(3));
    let runner = BenchmarkRunner::new(fleet.clone(), config());

    let run = runner.run(params(), &CancellationToken::new()).await.unwrap();
    assert_eq!(run.status, TaskState::NoResource);
    assert!(run.cas.is_none());
    assert_eq!(run.attempts, 3);
    assert!(fleet.task_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_running_task_cancels_it_on_the_fleet_once() {
    let fleet = Arc::new(FakeFleet::new().with_default_script(vec![TaskState::Running]));
    let runner = Arc::new(BenchmarkRunner::new(fleet.clone(), config()));
    let cancel = CancellationToken::new();

    let handle = {
        let (runner, cancel) = (runner.clone(), cancel.clone());
        tokio::spawn(async move { runner.run(params(), &cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(45)).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, BisectError::Cancelled), "{err:?}");
    assert_eq!(fleet.cancel_calls(), vec!["task-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn cancelling_after_completion_leaves_the_task_alone() {
    let fleet = Arc::new(
        FakeFleet::new()
            .with_default_script(vec![TaskState::Completed])
            .hang_on_cas_output(),
    );
    let runner = Arc::new(BenchmarkRunner::new(fleet.clone(), config()));
    let cancel = CancellationToken::new();

    let handle = {
        let (runner, cancel) = (runner.clone(), cancel.clone());
        tokio::spawn(async move { runner.run(params(), &cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(fleet.cancel_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_beats_between_polls() {
    let fleet = Arc::new(FakeFleet::new().with_default_script(vec![
        TaskState::Pending,
        TaskState::Pending,
        TaskState::Running,
        TaskState::Completed,
    ]));
    let heartbeat = Arc::new(CountingHeartbeat::default());
    let runner = BenchmarkRunner::new(fleet, config()).with_heartbeat(heartbeat.clone());

    let run = runner.run(params(), &CancellationToken::new()).await.unwrap();
    assert!(run.is_successful());
    // One beat after each poll that did not settle the wait.
    assert_eq!(heartbeat.beats.load(Ordering::SeqCst), 2);
    let details = heartbeat.details.lock().unwrap().clone();
    assert_eq!(details, vec![TaskState::Pending.as_str().to_string(); 2]);
}
