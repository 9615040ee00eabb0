//! Runs a benchmark several times at one combined commit and collects the
//! samples.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

use crate::domain::{AggregationMethod, BisectError, BisectRequest, CombinedCommit, CommitRun, Result, TestRun};
use crate::fleet::TaskParams;
use crate::run_benchmark::BenchmarkRunner;
use crate::samples::{BuildProvider, ResultReader};

/// What to run at each commit of one bisection.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub job_id: String,
    pub bot_config: String,
    pub benchmark: String,
    pub story: String,
    pub story_tags: Option<String>,
    pub chart: String,
    pub aggregation: Option<AggregationMethod>,
    pub iterations: u32,
}

impl RunSettings {
    pub fn from_request(job_id: &str, request: &BisectRequest, iterations: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            bot_config: request.configuration.clone(),
            benchmark: request.benchmark.clone(),
            story: request.story.clone(),
            story_tags: request.story_tags.clone(),
            chart: request.chart.clone(),
            aggregation: request.aggregation_method,
            iterations,
        }
    }
}

pub struct CommitRunner {
    runner: Arc<BenchmarkRunner>,
    builds: Arc<dyn BuildProvider>,
    results: Arc<dyn ResultReader>,
}

impl CommitRunner {
    pub fn new(
        runner: Arc<BenchmarkRunner>,
        builds: Arc<dyn BuildProvider>,
        results: Arc<dyn ResultReader>,
    ) -> Self {
        Self {
            runner,
            builds,
            results,
        }
    }

    /// Run `settings.iterations` tasks at `commit` concurrently.
    ///
    /// The first failing task cancels its siblings, which clean up their
    /// own fleet tasks; that first error is returned.
    pub async fn run(
        &self,
        commit: &CombinedCommit,
        settings: &RunSettings,
        cancel: &CancellationToken,
    ) -> Result<CommitRun> {
        let build = self.builds.find_build(commit).await?;
        let params = TaskParams {
            job_id: settings.job_id.clone(),
            commit_key: commit.key(),
            bot_config: settings.bot_config.clone(),
            benchmark: settings.benchmark.clone(),
            story: settings.story.clone(),
            story_tags: settings.story_tags.clone(),
            build,
            pool: self.runner.config().swarming_pool.clone(),
            bot_id: None,
        };

        let siblings = cancel.child_token();
        let mut set = JoinSet::new();
        for i in 0..settings.iterations {
            let runner = Arc::clone(&self.runner);
            let params = params.clone();
            let token = siblings.clone();
            set.spawn(async move { (i, runner.run(params, &token).await) }.in_current_span());
        }

        let mut runs: Vec<(u32, TestRun)> = Vec::with_capacity(settings.iterations as usize);
        let mut first_err: Option<BisectError> = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(|e| BisectError::Fleet {
                operation: "run_benchmark".to_string(),
                reason: e.to_string(),
            });
            match outcome {
                Ok((i, Ok(run))) => runs.push((i, run)),
                Ok((_, Err(e))) | Err(e) => {
                    siblings.cancel();
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        runs.sort_by_key(|(i, _)| *i);
        let runs: Vec<TestRun> = runs.into_iter().map(|(_, run)| run).collect();

        let reads = runs.iter().filter_map(|run| run.cas.as_ref()).map(|cas| {
            self.results
                .read_values(cas, &settings.benchmark, &settings.chart)
        });
        let per_run = futures::future::try_join_all(reads).await?;

        let mut samples = Vec::new();
        for values in per_run {
            match settings.aggregation {
                Some(method) => samples.extend(method.apply(&values)),
                None => samples.extend(values),
            }
        }

        let run = CommitRun {
            commit: commit.clone(),
            runs,
            values: BTreeMap::from([(settings.chart.clone(), samples)]),
        };
        info!(
            commit = %commit,
            runs = run.runs.len(),
            successful = run.successful_runs(),
            samples = run.all_values(&settings.chart).len(),
            "commit run collected"
        );
        Ok(run)
    }
}
