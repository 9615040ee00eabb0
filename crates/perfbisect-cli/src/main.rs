//! perfbisect - performance regression bisection
//!
//! ## Commands
//!
//! - `schedule`: bisect a benchmark regression between two commits
//! - `resume`: continue jobs a previous process left running
//! - `query` / `list` / `cancel`: inspect and stop jobs
//! - `midpoint`, `deps`, `compare`: run single engine steps by hand

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use perfbisect_core::{
    compare, fetch_git_deps, gitiles_provider, hash_matches, AggregationMethod, BenchmarkRunner, BisectConfig,
    BisectRequest, BisectWorkflow, BisectionReport, BisectionService, CommitRunner, ManifestBuilds,
    MidpointResolver, RepoProvider, ResultsDir, SwarmingClient, DEFAULT_REPOSITORY,
};
use perfbisect_state::{JobId, JobLedger, JobStatus, SurrealJobLedger};
use serde::Serialize;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "perfbisect")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Find the commit that moved a benchmark", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where builds come from and where task results are read.
#[derive(clap::Args, Clone)]
struct Artifacts {
    /// JSON manifest mapping commit keys to build digests
    #[arg(long, env = "PERFBISECT_BUILDS")]
    builds: PathBuf,

    /// Directory holding `{digest}.json` result documents
    #[arg(long, env = "PERFBISECT_RESULTS_DIR")]
    results_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Bisect a regression and wait for the culprit
    Schedule {
        /// Last known good commit
        #[arg(long)]
        start: String,

        /// First known bad commit
        #[arg(long)]
        end: String,

        #[arg(long)]
        benchmark: String,

        #[arg(long)]
        story: String,

        /// Metric to compare
        #[arg(long)]
        chart: String,

        /// Bot configuration, e.g. `linux-perf`
        #[arg(long)]
        configuration: String,

        #[arg(long, default_value = DEFAULT_REPOSITORY)]
        repository: String,

        /// Smallest mean shift that counts as a change
        #[arg(long)]
        magnitude: Option<String>,

        /// Reduce each run to one value: mean, min, max, sum, count or std
        #[arg(long)]
        aggregation: Option<String>,

        #[arg(long)]
        story_tags: Option<String>,

        #[command(flatten)]
        artifacts: Artifacts,

        /// Print the job id and exit without waiting
        #[arg(long)]
        detach: bool,
    },

    /// Resume every job left running and wait for them
    Resume {
        #[command(flatten)]
        artifacts: Artifacts,
    },

    /// Show one job
    Query {
        #[arg(long)]
        job: String,
    },

    /// List jobs, optionally filtered by status
    List {
        /// running, completed, failed or cancelled
        #[arg(long)]
        status: Option<String>,
    },

    /// Cancel a running job
    Cancel {
        #[arg(long)]
        job: String,
    },

    /// Print the commit halfway between two commits
    Midpoint {
        #[arg(long, default_value = DEFAULT_REPOSITORY)]
        repo: String,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,
    },

    /// Print the git dependencies pinned at a revision
    Deps {
        #[arg(long, default_value = DEFAULT_REPOSITORY)]
        repo: String,

        #[arg(long)]
        revision: String,
    },

    /// Compare two sample files (JSON arrays of numbers)
    Compare {
        #[arg(long)]
        a: PathBuf,

        #[arg(long)]
        b: PathBuf,

        #[arg(long, default_value_t = 1.0)]
        magnitude: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    perfbisect_core::init_tracing(cli.json, level);

    let config = BisectConfig::from_env();
    config.validate().context("Invalid PERFBISECT_* configuration")?;

    match cli.command {
        Commands::Schedule {
            start,
            end,
            benchmark,
            story,
            chart,
            configuration,
            repository,
            magnitude,
            aggregation,
            story_tags,
            artifacts,
            detach,
        } => {
            let mut request = BisectRequest::new(start, end, benchmark, story, chart, configuration)
                .with_repository(repository);
            if let Some(magnitude) = magnitude {
                request = request.with_magnitude(magnitude);
            }
            if let Some(method) = aggregation {
                request = request.with_aggregation(method.parse::<AggregationMethod>()?);
            }
            if let Some(tags) = story_tags {
                request = request.with_story_tags(tags);
            }
            cmd_schedule(&config, &artifacts, request, detach).await
        }
        Commands::Resume { artifacts } => cmd_resume(&config, &artifacts).await,
        Commands::Query { job } => cmd_query(&open_ledger().await?, &job, cli.json).await,
        Commands::List { status } => cmd_list(&open_ledger().await?, status.as_deref(), cli.json).await,
        Commands::Cancel { job } => cmd_cancel(&open_ledger().await?, &job).await,
        Commands::Midpoint { repo, start, end } => cmd_midpoint(&config, &repo, &start, &end).await,
        Commands::Deps { repo, revision } => cmd_deps(&config, &repo, &revision, cli.json).await,
        Commands::Compare { a, b, magnitude } => cmd_compare(&a, &b, magnitude, cli.json),
    }
}

async fn open_ledger() -> Result<Arc<dyn JobLedger>> {
    let ledger = SurrealJobLedger::from_env()
        .await
        .context("Failed to connect to the job database")?;
    Ok(Arc::new(ledger))
}

async fn build_service(config: &BisectConfig, artifacts: &Artifacts) -> Result<BisectionService> {
    let ledger = open_ledger().await?;

    let builds = ManifestBuilds::from_file(&artifacts.builds, &config.cas_instance)
        .await
        .with_context(|| format!("Failed to load build manifest {}", artifacts.builds.display()))?;
    info!(builds = builds.len(), "build manifest loaded");

    let fleet = Arc::new(SwarmingClient::new(config)?);
    let runner = Arc::new(BenchmarkRunner::new(fleet, config.clone()));
    let commits = Arc::new(CommitRunner::new(
        runner,
        Arc::new(builds),
        Arc::new(ResultsDir::new(&artifacts.results_dir)),
    ));
    let repos = Arc::new(gitiles_provider(config.auth_token.clone())?);
    let resolver = Arc::new(MidpointResolver::new(repos));
    let workflow = Arc::new(BisectWorkflow::new(resolver, commits, config.clone()));
    Ok(BisectionService::new(ledger, workflow))
}

/// Wait for `job`, cancelling it on Ctrl-C.
async fn wait_or_interrupt(service: &BisectionService, job: &JobId) -> Result<BisectionReport> {
    let wait = service.wait(job);
    tokio::pin!(wait);
    tokio::select! {
        report = &mut wait => return Ok(report?),
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %job, "interrupted, cancelling job");
            service.cancel_job(job).await?;
        }
    }
    // Keep waiting so the job's fleet tasks are cancelled before exit.
    Ok(wait.await?)
}

/// Schedule a bisection
async fn cmd_schedule(
    config: &BisectConfig,
    artifacts: &Artifacts,
    request: BisectRequest,
    detach: bool,
) -> Result<()> {
    let service = build_service(config, artifacts).await?;
    let job = service.schedule_bisection(request).await?;
    println!("Scheduled job {}", job);
    if detach {
        return Ok(());
    }

    let report = wait_or_interrupt(&service, &job).await?;
    print_report(&report);
    if report.status == JobStatus::Failed {
        bail!("job {} failed", job);
    }
    Ok(())
}

async fn cmd_resume(config: &BisectConfig, artifacts: &Artifacts) -> Result<()> {
    let service = build_service(config, artifacts).await?;
    let resumed = service.resume_incomplete().await?;
    if resumed.is_empty() {
        println!("No running jobs to resume");
        return Ok(());
    }

    println!("Resumed {} job(s)", resumed.len());
    for job in &resumed {
        let report = wait_or_interrupt(&service, job).await?;
        print_report(&report);
    }
    Ok(())
}

async fn cmd_query(ledger: &Arc<dyn JobLedger>, job: &str, json: bool) -> Result<()> {
    let record = ledger
        .get_job(&JobId::from(job))
        .await
        .with_context(|| format!("Failed to load job '{}'", job))?;
    let report = BisectionReport::from(record);
    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(())
}

async fn cmd_list(ledger: &Arc<dyn JobLedger>, status: Option<&str>, json: bool) -> Result<()> {
    let status = status.map(str::parse::<JobStatus>).transpose()?;
    let reports: Vec<BisectionReport> = ledger
        .list_jobs(status)
        .await?
        .into_iter()
        .map(BisectionReport::from)
        .collect();

    if json {
        return print_json(&reports);
    }
    if reports.is_empty() {
        println!("No jobs found");
        return Ok(());
    }
    for report in reports {
        println!(
            "{:<36} {:<10} {}",
            report.execution.job_id,
            report.status.to_string(),
            culprit_text(&report)
        );
    }
    Ok(())
}

/// Mark a job cancelled. The process driving it stops once its current
/// step finishes.
async fn cmd_cancel(ledger: &Arc<dyn JobLedger>, job: &str) -> Result<()> {
    let job_id = JobId::from(job);
    let record = ledger
        .get_job(&job_id)
        .await
        .with_context(|| format!("Failed to load job '{}'", job))?;
    if record.status.is_terminal() {
        println!("Job {} already {}", job, record.status);
        return Ok(());
    }
    ledger.cancel_job(&job_id).await?;
    println!("Cancelled job {}", job);
    Ok(())
}

async fn cmd_midpoint(config: &BisectConfig, repo: &str, start: &str, end: &str) -> Result<()> {
    let repos = Arc::new(gitiles_provider(config.auth_token.clone())?);
    let resolver = MidpointResolver::new(repos);
    let mid = resolver.find_midpoint(repo, start, end).await?;
    if hash_matches(&mid, start) {
        println!("{} and {} are adjacent", short(start), short(end));
    } else {
        println!("{}", mid);
    }
    Ok(())
}

async fn cmd_deps(config: &BisectConfig, repo: &str, revision: &str, json: bool) -> Result<()> {
    let repos = gitiles_provider(config.auth_token.clone())?;
    let source = repos.get_or_create(repo)?;
    let manifest = fetch_git_deps(source.as_ref(), revision).await?;

    if json {
        let entries: Vec<DepEntry<'_>> = manifest
            .iter()
            .map(|(url, git_hash)| DepEntry { url, git_hash })
            .collect();
        return print_json(&entries);
    }
    if manifest.is_empty() {
        println!("No git dependencies at {}", short(revision));
        return Ok(());
    }
    for (url, git_hash) in manifest.iter() {
        println!("{} {}", short(git_hash), url);
    }
    Ok(())
}

fn cmd_compare(a: &Path, b: &Path, magnitude: f64, json: bool) -> Result<()> {
    let samples_a: Vec<f64> = read_json_file(a)?;
    let samples_b: Vec<f64> = read_json_file(b)?;
    let result = compare(&samples_a, &samples_b, magnitude)?;
    if json {
        return print_json(&result);
    }
    println!("verdict: {}", result.verdict);
    println!("p-value: {:.6}", result.p_value);
    println!("mean a:  {:.4} (n={})", result.mean_a, result.n_a);
    println!("mean b:  {:.4} (n={})", result.mean_b, result.n_b);
    Ok(())
}

#[derive(Serialize)]
struct DepEntry<'a> {
    url: &'a str,
    git_hash: &'a str,
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &BisectionReport) {
    println!("job      {}", report.execution.job_id);
    println!("status   {}", report.status);
    println!("culprit  {}", culprit_text(report));
    println!("steps    {}", report.total_steps);
    println!("elapsed  {} ms", report.duration_ms);
    if let Some(error) = &report.error {
        println!("error    {}", error);
    }
}

fn culprit_text(report: &BisectionReport) -> String {
    match &report.execution.culprit {
        Some(c) => format!("{} @ {}", short(&c.git_hash), c.repository_url),
        None => "-".to_string(),
    }
}

fn short(hash: &str) -> &str {
    &hash[..8.min(hash.len())]
}
