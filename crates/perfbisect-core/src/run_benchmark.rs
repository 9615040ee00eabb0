//! Benchmark execution activity: run one task on the fleet to completion.
//!
//! Submission, pending wait, terminal wait and artifact fetch. Every wait
//! is a cancellable suspension point; a cancelled activity cancels its
//! still-live task on the fleet before returning.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::BisectConfig;
use crate::domain::{BisectError, Result, TestRun};
use crate::fleet::{FleetClient, TaskParams, TaskState};
use crate::metrics::METRICS;
use crate::obs::{self, Heartbeat, TracingHeartbeat};

pub struct BenchmarkRunner {
    fleet: Arc<dyn FleetClient>,
    config: BisectConfig,
    heartbeat: Arc<dyn Heartbeat>,
}

/// Where a single submission ended up.
enum Submission {
    /// Retry with the pin cleared.
    NoResource,
    Done(TestRun),
}

impl BenchmarkRunner {
    pub fn new(fleet: Arc<dyn FleetClient>, config: BisectConfig) -> Self {
        Self {
            fleet,
            config,
            heartbeat: Arc::new(TracingHeartbeat),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn Heartbeat>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn config(&self) -> &BisectConfig {
        &self.config
    }

    /// Run one benchmark task.
    ///
    /// A task the fleet could not place on a bot is resubmitted without its
    /// bot pin, up to `max_schedule_attempts` submissions in total. A task
    /// that ends in any other non-success state is returned as-is with no
    /// artifact.
    pub async fn run(&self, mut params: TaskParams, cancel: &CancellationToken) -> Result<TestRun> {
        let max_attempts = self.config.max_schedule_attempts.max(1);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(BisectError::Cancelled);
            }
            attempt += 1;
            match self.submit(&params, attempt, cancel).await? {
                Submission::Done(run) => return Ok(run),
                Submission::NoResource if attempt < max_attempts => {
                    METRICS.inc_no_resource_retries();
                    obs::emit_no_resource_retry(&params.commit_key, attempt);
                    params.bot_id = None;
                }
                Submission::NoResource => {
                    return Ok(TestRun {
                        task_id: String::new(),
                        status: TaskState::NoResource,
                        cas: None,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    async fn submit(&self, params: &TaskParams, attempt: u32, cancel: &CancellationToken) -> Result<Submission> {
        // Not raced against cancellation: an abandoned trigger could leave a
        // task we hold no id for.
        let task_id = match self.fleet.trigger_task(&params.to_request()).await {
            Ok(id) => id,
            Err(BisectError::NoResource { reason }) => {
                tracing::debug!(commit = %params.commit_key, attempt, reason = %reason, "trigger rejected");
                return Ok(Submission::NoResource);
            }
            Err(e) => {
                return Err(BisectError::Scheduling {
                    commit: params.commit_key.clone(),
                    attempt,
                    reason: e.to_string(),
                })
            }
        };
        METRICS.inc_tasks_scheduled();
        obs::emit_task_scheduled(&task_id, &params.commit_key, attempt);

        let mut last = TaskState::Pending;
        match self.track(&task_id, &mut last, cancel).await {
            Ok(Some(run)) => Ok(Submission::Done(TestRun { attempts: attempt, ..run })),
            Ok(None) => Ok(Submission::NoResource),
            Err(e) if e.is_cancelled() => {
                self.cleanup(&task_id, &last).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Follow a submitted task to its end. `None` when it found no bot.
    async fn track(&self, task_id: &str, last: &mut TaskState, cancel: &CancellationToken) -> Result<Option<TestRun>> {
        self.poll_until(task_id, last, cancel, |s| !s.is_pending()).await?;
        if last.is_no_resource() {
            return Ok(None);
        }
        if !last.is_finished() {
            self.poll_until(task_id, last, cancel, TaskState::is_finished).await?;
        }

        let cas = if last.is_successful() {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Err(BisectError::Cancelled),
                r = self.fleet.get_cas_output(task_id) => r?,
            };
            Some(fetched)
        } else {
            None
        };

        Ok(Some(TestRun {
            task_id: task_id.to_string(),
            status: last.clone(),
            cas,
            attempts: 0,
        }))
    }

    async fn poll_until(
        &self,
        task_id: &str,
        last: &mut TaskState,
        cancel: &CancellationToken,
        done: impl Fn(&TaskState) -> bool,
    ) -> Result<()> {
        // Failures count toward the budget for the whole wait, not per streak.
        let budget = self.config.max_poll_failures.max(1);
        let mut remaining = budget;
        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => return Err(BisectError::Cancelled),
                r = self.fleet.get_status(task_id) => r,
            };
            match polled {
                Ok(state) => {
                    if state != *last {
                        obs::emit_task_state(task_id, state.as_str());
                    }
                    *last = state;
                    if done(&*last) {
                        return Ok(());
                    }
                }
                Err(e) => {
                    remaining -= 1;
                    METRICS.inc_poll_failures();
                    obs::emit_poll_failure(task_id, remaining, &e);
                    if remaining == 0 {
                        return Err(BisectError::Polling {
                            task_id: task_id.to_string(),
                            attempts: budget,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            self.heartbeat.beat(task_id, last.as_str());
            tokio::select! {
                _ = cancel.cancelled() => return Err(BisectError::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }

    /// Cancel a task that may still be running. Finished tasks are left alone.
    async fn cleanup(&self, task_id: &str, last: &TaskState) {
        if task_id.is_empty() || last.is_finished() {
            return;
        }
        match self.fleet.cancel(task_id).await {
            Ok(()) => obs::emit_task_cleanup(task_id, None),
            Err(e) => obs::emit_task_cleanup(task_id, Some(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeFleet;
    use crate::fleet::CasReference;
    use std::time::Duration;

    fn params() -> TaskParams {
        TaskParams {
            job_id: "job-1".to_string(),
            commit_key: "aaaaaaaaaa".to_string(),
            bot_config: "linux-perf".to_string(),
            benchmark: "speedometer2".to_string(),
            story: "Speedometer2".to_string(),
            story_tags: None,
            build: CasReference::new("instance", "build-1", 42),
            pool: "pool".to_string(),
            bot_id: Some("bot-7".to_string()),
        }
    }

    fn runner(fleet: Arc<FakeFleet>) -> BenchmarkRunner {
        BenchmarkRunner::new(fleet, BisectConfig::default().with_poll_interval(Duration::from_secs(15)))
    }

    #[tokio::test(start_paused = true)]
    async fn completed_task_returns_artifact() {
        let fleet = Arc::new(FakeFleet::new().with_default_script(vec![
            TaskState::Pending,
            TaskState::Running,
            TaskState::Completed,
        ]));
        let run = runner(fleet.clone()).run(params(), &CancellationToken::new()).await.unwrap();
        assert!(run.is_successful());
        assert_eq!(run.attempts, 1);
        assert_eq!(run.cas.unwrap().digest.hash, "build-1-results");
        assert!(fleet.cancel_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_is_a_result_not_an_error() {
        let fleet = Arc::new(FakeFleet::new().with_default_script(vec![TaskState::Running, TaskState::BotDied]));
        let run = runner(fleet).run(params(), &CancellationToken::new()).await.unwrap();
        assert_eq!(run.status, TaskState::BotDied);
        assert!(run.cas.is_none());
        assert!(!run.is_successful());
    }

    #[tokio::test(start_paused = true)]
    async fn no_resource_state_retries_without_pin() {
        let fleet = Arc::new(
            FakeFleet::new()
                .with_script(vec![TaskState::NoResource])
                .with_script(vec![TaskState::NoResource]),
        );
        let run = runner(fleet.clone()).run(params(), &CancellationToken::new()).await.unwrap();
        assert!(run.is_successful());
        assert_eq!(run.attempts, 3);

        let requests = fleet.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].dimensions.get("id").map(String::as_str), Some("bot-7"));
        assert!(requests[1].dimensions.get("id").is_none());
        assert!(requests[2].dimensions.get("id").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn no_resource_exhausts_attempts() {
        let fleet = Arc::new(FakeFleet::new().with_default_script(vec![TaskState::NoResource]));
        let run = runner(fleet.clone()).run(params(), &CancellationToken::new()).await.unwrap();
        assert_eq!(run.status, TaskState::NoResource);
        assert_eq!(run.attempts, 3);
        assert_eq!(fleet.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn other_trigger_errors_fail_immediately() {
        let fleet = Arc::new(FakeFleet::new().fail_next_trigger("quota exceeded"));
        let err = runner(fleet.clone()).run(params(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BisectError::Scheduling { attempt: 1, .. }));
        assert_eq!(fleet.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failures_within_budget_are_retried() {
        let fleet = Arc::new(FakeFleet::new().fail_next_polls(4));
        let run = runner(fleet).run(params(), &CancellationToken::new()).await.unwrap();
        assert!(run.is_successful());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_budget_exhaustion_surfaces_last_error() {
        let fleet = Arc::new(FakeFleet::new().fail_next_polls(5));
        let err = runner(fleet).run(params(), &CancellationToken::new()).await.unwrap_err();
        match err {
            BisectError::Polling { attempts, reason, .. } => {
                assert_eq!(attempts, 5);
                assert!(reason.contains("poll 5"));
            }
            other => panic!("expected polling error, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scattered_poll_failures_share_one_budget() {
        // Pending wait: fail, Running. Finished wait: five failures between
        // successful polls exhaust the budget before Completed comes up.
        let mut script = vec![TaskState::Running; 8];
        script.push(TaskState::Completed);
        let fleet = Arc::new(FakeFleet::new().with_default_script(script).fail_alternate_polls(6));
        let err = runner(fleet.clone()).run(params(), &CancellationToken::new()).await.unwrap_err();
        match err {
            BisectError::Polling { attempts, reason, .. } => {
                assert_eq!(attempts, 5);
                assert!(reason.contains("poll 6"));
            }
            other => panic!("expected polling error, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn each_wait_phase_gets_a_fresh_budget() {
        // Four failures while pending, four more while running.
        let script = vec![
            TaskState::Pending,
            TaskState::Pending,
            TaskState::Pending,
            TaskState::Running,
            TaskState::Running,
            TaskState::Running,
            TaskState::Running,
            TaskState::Running,
            TaskState::Completed,
        ];
        let fleet = Arc::new(FakeFleet::new().with_default_script(script).fail_alternate_polls(8));
        let run = runner(fleet).run(params(), &CancellationToken::new()).await.unwrap();
        assert!(run.is_successful());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_submission_never_triggers() {
        let fleet = Arc::new(FakeFleet::new());
        let token = CancellationToken::new();
        token.cancel();
        let err = runner(fleet.clone()).run(params(), &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(fleet.requests().is_empty());
    }
}
