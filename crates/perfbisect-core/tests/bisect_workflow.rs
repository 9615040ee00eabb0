//! End-to-end bisection scenarios over fake source control and a fake fleet.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use perfbisect_core::domain::digest::digest_of;
use perfbisect_core::fakes::{FakeBuilds, FakeFleet, FakeRepo, FakeRepoProvider, FakeResults};
use perfbisect_core::{
    BenchmarkRunner, BisectConfig, BisectRequest, BisectWorkflow, Commit, CommitRunner,
    MidpointResolver, StepJournal,
};
use perfbisect_state::fakes::MemoryJobLedger;
use perfbisect_state::{JobId, JobLedger, JobMetadata};
use tokio_util::sync::CancellationToken;

const SRC: &str = "https://chromium.googlesource.com/chromium/src";
const V8: &str = "https://chromium.googlesource.com/v8/v8";

fn build_workflow(provider: FakeRepoProvider, fleet: Arc<FakeFleet>, results: FakeResults) -> BisectWorkflow {
    let config = BisectConfig::default()
        .with_poll_interval(Duration::from_secs(15))
        .with_iterations(10);
    let runner = Arc::new(BenchmarkRunner::new(fleet, config.clone()));
    let commits = Arc::new(CommitRunner::new(runner, Arc::new(FakeBuilds), Arc::new(results)));
    let resolver = Arc::new(MidpointResolver::new(Arc::new(provider)));
    BisectWorkflow::new(resolver, commits, config)
}

fn request(start: &str, end: &str) -> BisectRequest {
    BisectRequest::new(start, end, "speedometer2", "Speedometer2", "Score", "linux-perf")
        .with_repository(SRC)
        .with_magnitude("1.0")
}

async fn journal_for(ledger: &Arc<dyn JobLedger>, job: &JobId, req: &BisectRequest) -> StepJournal {
    let metadata = JobMetadata {
        benchmark: req.benchmark.clone(),
        story: req.story.clone(),
        chart: req.chart.clone(),
        request: serde_json::to_value(req).unwrap(),
    };
    ledger
        .create_job(job, &digest_of(req).unwrap(), metadata)
        .await
        .unwrap();
    StepJournal::open(Arc::clone(ledger), job.clone()).await.unwrap()
}

/// Distinct commit keys the fleet was asked to benchmark.
fn benchmarked_commits(fleet: &FakeFleet) -> BTreeSet<String> {
    fleet
        .requests()
        .iter()
        .filter_map(|r| r.tags.iter().find_map(|t| t.strip_prefix("commit:")))
        .map(str::to_string)
        .collect()
}

/// Low values before commit `culprit`, high values from it on.
fn step_results(repo: Arc<FakeRepo>, culprit: usize) -> FakeResults {
    FakeResults::from_fn(move |key| match repo.index_of(key) {
        Some(i) if i >= culprit => vec![100.0],
        _ => vec![10.0],
    })
}

#[tokio::test(start_paused = true)]
async fn nine_commit_history_finds_first_regressed_commit() {
    let src = Arc::new(FakeRepo::linear(SRC, "c", 9));
    let fleet = Arc::new(FakeFleet::new());
    let workflow = build_workflow(
        FakeRepoProvider::new().with_repo(src.clone()),
        fleet.clone(),
        step_results(src.clone(), 5),
    );

    let ledger: Arc<dyn JobLedger> = Arc::new(MemoryJobLedger::new());
    let job = JobId::from("job-nine");
    let req = request(&src.hash(0), &src.hash(8));
    let journal = journal_for(&ledger, &job, &req).await;

    let execution = workflow
        .run(&job.0, &req, &journal, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(execution.culprit, Some(Commit::new(SRC, src.hash(5))));

    // Two endpoints plus at most ceil(log2(9)) midpoints.
    let commits = benchmarked_commits(&fleet);
    assert!(commits.len() - 2 <= 4, "ran {} commits", commits.len());
    for expected in [0, 4, 5, 6, 8] {
        assert!(commits.contains(&src.hash(expected)), "c{expected} was not benchmarked");
    }
}

#[tokio::test(start_paused = true)]
async fn unchanged_range_reports_no_culprit() {
    let src = Arc::new(FakeRepo::linear(SRC, "c", 9));
    let fleet = Arc::new(FakeFleet::new());
    let workflow = build_workflow(
        FakeRepoProvider::new().with_repo(src.clone()),
        fleet.clone(),
        FakeResults::from_fn(|_| vec![42.0]),
    );

    let ledger: Arc<dyn JobLedger> = Arc::new(MemoryJobLedger::new());
    let job = JobId::from("job-flat");
    let req = request(&src.hash(0), &src.hash(8));
    let journal = journal_for(&ledger, &job, &req).await;

    let execution = workflow
        .run(&job.0, &req, &journal, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(execution.culprit, None);
    assert_eq!(benchmarked_commits(&fleet).len(), 2);
    assert_eq!(src.log_linear_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_endpoint_runs_yield_no_culprit() {
    let src = Arc::new(FakeRepo::linear(SRC, "c", 4));
    let fleet = Arc::new(FakeFleet::new().with_default_script(vec![perfbisect_core::TaskState::BotDied]));
    let workflow = build_workflow(
        FakeRepoProvider::new().with_repo(src.clone()),
        fleet,
        step_results(src.clone(), 2),
    );

    let ledger: Arc<dyn JobLedger> = Arc::new(MemoryJobLedger::new());
    let job = JobId::from("job-dead");
    let req = request(&src.hash(0), &src.hash(3));
    let journal = journal_for(&ledger, &job, &req).await;

    // Empty sample sets compare as unknown, which the loop reads as no change.
    let execution = workflow
        .run(&job.0, &req, &journal, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(execution.culprit, None);
}

#[tokio::test(start_paused = true)]
async fn inconclusive_midpoint_ends_bisection_without_culprit() {
    let src = Arc::new(FakeRepo::linear(SRC, "c", 9));
    let results = {
        let src = src.clone();
        let mid_reads = AtomicUsize::new(0);
        FakeResults::from_fn(move |key| match src.index_of(key) {
            // Three of the midpoint's ten runs read low and seven read high.
            // Against either endpoint the shift is large but p is near 0.1.
            Some(4) => {
                let n = mid_reads.fetch_add(1, Ordering::SeqCst);
                if n % 10 < 3 {
                    vec![0.0]
                } else {
                    vec![110.0]
                }
            }
            Some(i) if i > 4 => vec![100.0],
            _ => vec![10.0],
        })
    };
    let fleet = Arc::new(FakeFleet::new());
    let workflow = build_workflow(
        FakeRepoProvider::new().with_repo(src.clone()),
        fleet.clone(),
        results,
    );

    let ledger: Arc<dyn JobLedger> = Arc::new(MemoryJobLedger::new());
    let job = JobId::from("job-noisy");
    let req = request(&src.hash(0), &src.hash(8));
    let journal = journal_for(&ledger, &job, &req).await;

    let execution = workflow
        .run(&job.0, &req, &journal, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(execution.culprit, None);

    // Neither half was chosen, so no second midpoint was benchmarked.
    let expected: BTreeSet<String> = [0, 4, 8].into_iter().map(|i| src.hash(i)).collect();
    assert_eq!(benchmarked_commits(&fleet), expected);
}

#[tokio::test(start_paused = true)]
async fn regression_inside_rolled_dependency_is_blamed_on_dependency_commit() {
    let v8 = Arc::new(FakeRepo::linear(V8, "d", 9));
    let src = Arc::new(
        FakeRepo::linear(SRC, "m", 2)
            .with_deps_at(0, &[(V8, &v8.hash(0))])
            .with_deps_at(1, &[(V8, &v8.hash(8))]),
    );
    let results = {
        let (src, v8) = (src.clone(), v8.clone());
        FakeResults::from_fn(move |key| {
            let regressed = match key.split_once('+') {
                Some((_, dep)) => v8.index_of(dep).is_some_and(|i| i >= 5),
                None => src.index_of(key) == Some(1),
            };
            if regressed {
                vec![100.0]
            } else {
                vec![10.0]
            }
        })
    };
    let fleet = Arc::new(FakeFleet::new());
    let workflow = build_workflow(
        FakeRepoProvider::new().with_repo(src.clone()).with_repo(v8.clone()),
        fleet.clone(),
        results,
    );

    let ledger: Arc<dyn JobLedger> = Arc::new(MemoryJobLedger::new());
    let job = JobId::from("job-roll");
    let req = request(&src.hash(0), &src.hash(1));
    let journal = journal_for(&ledger, &job, &req).await;

    let execution = workflow
        .run(&job.0, &req, &journal, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(execution.culprit, Some(Commit::new(V8, v8.hash(5))));

    // The first midpoint is the outer start pinned to the dependency's midpoint.
    let commits = benchmarked_commits(&fleet);
    assert!(commits.contains(&format!("{}+{}", src.hash(0), v8.hash(4))));
}

#[tokio::test(start_paused = true)]
async fn resumed_workflow_replays_journal_without_touching_the_fleet() {
    let src = Arc::new(FakeRepo::linear(SRC, "c", 9));
    let ledger: Arc<dyn JobLedger> = Arc::new(MemoryJobLedger::new());
    let job = JobId::from("job-resume");
    let req = request(&src.hash(0), &src.hash(8));

    let first_fleet = Arc::new(FakeFleet::new());
    let first = build_workflow(
        FakeRepoProvider::new().with_repo(src.clone()),
        first_fleet.clone(),
        step_results(src.clone(), 5),
    );
    let journal = journal_for(&ledger, &job, &req).await;
    let original = first
        .run(&job.0, &req, &journal, &CancellationToken::new())
        .await
        .unwrap();
    let journaled = ledger.get_steps(&job).await.unwrap().len();
    assert!(journaled > 0);
    let log_calls = src.log_linear_calls();

    let second_fleet = Arc::new(FakeFleet::new());
    let second = build_workflow(
        FakeRepoProvider::new().with_repo(src.clone()),
        second_fleet.clone(),
        FakeResults::new(),
    );
    let journal = StepJournal::open(Arc::clone(&ledger), job.clone()).await.unwrap();
    assert_eq!(journal.replayable(), journaled);
    let replayed = second
        .run(&job.0, &req, &journal, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(replayed, original);
    assert!(second_fleet.requests().is_empty());
    assert_eq!(src.log_linear_calls(), log_calls);
    assert_eq!(ledger.get_steps(&job).await.unwrap().len(), journaled);
}
