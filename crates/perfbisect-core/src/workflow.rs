//! The bisection control loop.
//!
//! ```text
//! init:    run(low) || run(high)
//! gate:    compare(low, high) != Different  -> no culprit
//! narrow:  find_next_candidate(low, high)
//!            Adjacent(c)                     -> culprit c
//!            Candidate(mid)                  -> run(mid)
//!          compare(low, mid) == Different    -> high = mid
//!          compare(mid, high) == Different   -> low = mid
//!          otherwise                         -> no culprit
//! ```
//!
//! Every run, midpoint and comparison goes through the [`StepJournal`], so a
//! restarted job replays its journaled steps and continues from the first
//! step it had not finished.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::commit_runner::{CommitRunner, RunSettings};
use crate::compare::{compare, ComparisonResult};
use crate::config::BisectConfig;
use crate::domain::{BisectError, BisectRequest, BisectionExecution, CombinedCommit, CommitRange, CommitRun, Result};
use crate::journal::{StepJournal, STEP_COMPARE, STEP_FIND_MID_COMMIT, STEP_RUN_COMMIT};
use crate::metrics::METRICS;
use crate::midpoint::{MidpointResolver, RangeStep};
use crate::obs;

pub struct BisectWorkflow {
    resolver: Arc<MidpointResolver>,
    commits: Arc<CommitRunner>,
    config: BisectConfig,
}

impl BisectWorkflow {
    pub fn new(resolver: Arc<MidpointResolver>, commits: Arc<CommitRunner>, config: BisectConfig) -> Self {
        Self {
            resolver,
            commits,
            config,
        }
    }

    /// Bisect `request` to its first culprit.
    ///
    /// Any error aborts the bisection; no culprit is guessed.
    pub async fn run(
        &self,
        job_id: &str,
        request: &BisectRequest,
        journal: &StepJournal,
        cancel: &CancellationToken,
    ) -> Result<BisectionExecution> {
        let magnitude = request.magnitude(self.config.default_magnitude)?;
        let settings = RunSettings::from_request(job_id, request, self.config.iterations);
        let finish = |culprit| BisectionExecution {
            job_id: job_id.to_string(),
            culprit,
        };

        let low = CombinedCommit::new(request.start_commit());
        let high = CombinedCommit::new(request.end_commit());
        let (mut run_low, mut run_high) = self.run_endpoints(&low, &high, &settings, journal, cancel).await?;
        let mut range = CommitRange::new(low, high);

        let initial = self.compare_step(journal, &run_low, &run_high, &settings.chart, magnitude).await?;
        if !initial.is_different() {
            info!(job_id = %job_id, verdict = %initial.verdict, "no regression between endpoints");
            return Ok(finish(None));
        }

        loop {
            if cancel.is_cancelled() {
                return Err(BisectError::Cancelled);
            }

            let step = journal
                .record(STEP_FIND_MID_COMMIT, self.resolver.find_next_candidate(&range))
                .await?;
            let mid = match step {
                RangeStep::Adjacent { culprit } => {
                    info!(job_id = %job_id, culprit = %culprit, "culprit found");
                    return Ok(finish(Some(culprit)));
                }
                RangeStep::Candidate { mid, range: bracket } => {
                    range = bracket;
                    mid
                }
            };

            let run_mid = journal
                .record(STEP_RUN_COMMIT, self.commits.run(&mid, &settings, cancel))
                .await?;

            let lower = self.compare_step(journal, &run_low, &run_mid, &settings.chart, magnitude).await?;
            if lower.is_different() {
                range = CommitRange::new(range.low, mid);
                run_high = run_mid;
                continue;
            }
            let upper = self.compare_step(journal, &run_mid, &run_high, &settings.chart, magnitude).await?;
            if upper.is_different() {
                range = CommitRange::new(mid, range.high);
                run_low = run_mid;
                continue;
            }

            info!(job_id = %job_id, mid = %mid, "regression could not be localized past this midpoint");
            return Ok(finish(None));
        }
    }

    /// Run both endpoints concurrently. A failure at one endpoint cancels
    /// the other so its tasks are cleaned up instead of dropped.
    async fn run_endpoints(
        &self,
        low: &CombinedCommit,
        high: &CombinedCommit,
        settings: &RunSettings,
        journal: &StepJournal,
        cancel: &CancellationToken,
    ) -> Result<(CommitRun, CommitRun)> {
        let endpoints = cancel.child_token();
        let (low_run, high_run) = tokio::join!(
            cancel_on_err(
                journal.record(STEP_RUN_COMMIT, self.commits.run(low, settings, &endpoints)),
                &endpoints,
            ),
            cancel_on_err(
                journal.record(STEP_RUN_COMMIT, self.commits.run(high, settings, &endpoints)),
                &endpoints,
            ),
        );

        match (low_run, high_run) {
            (Ok(low_run), Ok(high_run)) => Ok((low_run, high_run)),
            // Prefer the error that caused the other side's cancellation.
            (Err(e), Err(other)) if e.is_cancelled() && !cancel.is_cancelled() => Err(other),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    async fn compare_step(
        &self,
        journal: &StepJournal,
        a: &CommitRun,
        b: &CommitRun,
        chart: &str,
        magnitude: f64,
    ) -> Result<ComparisonResult> {
        let result = journal
            .record(STEP_COMPARE, async {
                compare(&a.all_values(chart), &b.all_values(chart), magnitude)
            })
            .await?;
        METRICS.inc_comparisons();
        obs::emit_comparison(&a.commit.to_string(), &b.commit.to_string(), result.verdict, result.p_value);
        Ok(result)
    }
}

async fn cancel_on_err<T>(step: impl Future<Output = Result<T>>, token: &CancellationToken) -> Result<T> {
    let result = step.await;
    if result.is_err() {
        token.cancel();
    }
    result
}
