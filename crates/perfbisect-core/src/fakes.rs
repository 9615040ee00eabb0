//! In-memory collaborators for tests and local dry runs.
//!
//! - [`FakeRepo`] / [`FakeRepoProvider`]: linear histories with per-commit `DEPS`
//! - [`FakeFleet`]: scripted task states, trigger failures and poll failures
//! - [`FakeBuilds`] / [`FakeResults`]: artifacts keyed by commit key

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::domain::{hash_matches, BisectError, CombinedCommit, Result};
use crate::fleet::{CasReference, FleetClient, TaskRequest, TaskState};
use crate::samples::{BuildProvider, ResultReader};
use crate::source::{CommitInfo, RepoProvider, SourceRepo};

const EMPTY_DEPS: &str = "deps = {}\n";
const RESULTS_SUFFIX: &str = "-results";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// FakeRepo
// ---------------------------------------------------------------------------

/// A repository with a single linear history.
pub struct FakeRepo {
    url: String,
    /// Oldest first.
    commits: Vec<CommitInfo>,
    deps: HashMap<usize, String>,
    log_linear_calls: AtomicUsize,
}

impl FakeRepo {
    /// `n` commits named `{label}0 .. {label}{n-1}` with 40-char hashes
    /// derived from the URL and name.
    pub fn linear(url: &str, label: &str, n: usize) -> Self {
        let mut commits: Vec<CommitInfo> = Vec::with_capacity(n);
        for i in 0..n {
            let digest = Sha256::digest(format!("{url}:{label}{i}").as_bytes());
            let hash = hex::encode(digest)[..40].to_string();
            let parents = commits.last().map(|p| vec![p.hash.clone()]).unwrap_or_default();
            commits.push(CommitInfo {
                hash,
                parents,
                author: "dev@example.com".to_string(),
                subject: format!("{label}{i}"),
            });
        }
        Self {
            url: url.to_string(),
            commits,
            deps: HashMap::new(),
            log_linear_calls: AtomicUsize::new(0),
        }
    }

    /// Pin dependencies at commit `i`, as `(dependency url, revision)`.
    pub fn with_deps_at(mut self, i: usize, deps: &[(&str, &str)]) -> Self {
        let mut content = String::from("deps = {\n");
        for (n, (url, rev)) in deps.iter().enumerate() {
            content.push_str(&format!("  'src/third_party/dep{n}': '{url}.git@{rev}',\n"));
        }
        content.push_str("}\n");
        self.deps.insert(i, content);
        self
    }

    /// Raw `DEPS` content at commit `i`.
    pub fn with_raw_deps_at(mut self, i: usize, content: &str) -> Self {
        self.deps.insert(i, content.to_string());
        self
    }

    pub fn hash(&self, i: usize) -> String {
        self.commits[i].hash.clone()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Position of a full or abbreviated hash.
    pub fn index_of(&self, hash: &str) -> Option<usize> {
        self.commits.iter().position(|c| hash_matches(&c.hash, hash))
    }

    pub fn log_linear_calls(&self) -> usize {
        self.log_linear_calls.load(Ordering::SeqCst)
    }

    fn resolve(&self, hash: &str) -> Result<usize> {
        self.index_of(hash).ok_or_else(|| BisectError::SourceControl {
            repository_url: self.url.clone(),
            reason: format!("unknown revision {hash}"),
        })
    }

    fn newest_first(&self, start: usize, end: usize) -> Vec<CommitInfo> {
        if start >= end {
            return Vec::new();
        }
        self.commits[start + 1..=end].iter().rev().cloned().collect()
    }
}

#[async_trait]
impl SourceRepo for FakeRepo {
    fn url(&self) -> &str {
        &self.url
    }

    async fn log(&self, range: &str) -> Result<Vec<CommitInfo>> {
        let (start, end) = range.split_once("..").ok_or_else(|| BisectError::SourceControl {
            repository_url: self.url.clone(),
            reason: format!("bad range {range}"),
        })?;
        Ok(self.newest_first(self.resolve(start)?, self.resolve(end)?))
    }

    async fn log_linear(&self, start: &str, end: &str) -> Result<Vec<CommitInfo>> {
        self.log_linear_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.newest_first(self.resolve(start)?, self.resolve(end)?))
    }

    async fn read_file_at_ref(&self, path: &str, revision: &str) -> Result<Vec<u8>> {
        let idx = self.resolve(revision)?;
        if path != crate::deps::DEPS_FILE {
            return Err(BisectError::SourceControl {
                repository_url: self.url.clone(),
                reason: format!("{path} not found at {revision}"),
            });
        }
        let content = self.deps.get(&idx).map(String::as_str).unwrap_or(EMPTY_DEPS);
        Ok(content.as_bytes().to_vec())
    }
}

/// Serves registered [`FakeRepo`]s; unknown URLs are a source-control error.
#[derive(Default)]
pub struct FakeRepoProvider {
    repos: HashMap<String, Arc<dyn SourceRepo>>,
}

impl FakeRepoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repo(mut self, repo: Arc<FakeRepo>) -> Self {
        self.repos.insert(repo.url.clone(), repo);
        self
    }
}

impl RepoProvider for FakeRepoProvider {
    fn get_or_create(&self, url: &str) -> Result<Arc<dyn SourceRepo>> {
        self.repos
            .get(url)
            .cloned()
            .ok_or_else(|| BisectError::SourceControl {
                repository_url: url.to_string(),
                reason: "unknown repository".to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// FakeFleet
// ---------------------------------------------------------------------------

enum TriggerFailure {
    NoResource,
    Error(String),
}

struct FakeTask {
    /// Remaining states; the last one repeats.
    states: VecDeque<TaskState>,
    input: CasReference,
}

#[derive(Default)]
struct FleetState {
    next_id: u64,
    default_script: Vec<TaskState>,
    scripts: VecDeque<Vec<TaskState>>,
    trigger_failures: VecDeque<TriggerFailure>,
    poll_failures: u32,
    alternate_failures: u32,
    alternate_fail_next: bool,
    poll_failures_seen: u32,
    tasks: HashMap<String, FakeTask>,
    requests: Vec<TaskRequest>,
    cancelled: Vec<String>,
}

/// Scripted fleet. Each triggered task walks through its script, one state
/// per status poll, repeating the last state.
pub struct FakeFleet {
    state: Mutex<FleetState>,
    hang_cas_output: AtomicBool,
}

impl Default for FakeFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeFleet {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FleetState {
                default_script: vec![TaskState::Completed],
                ..FleetState::default()
            }),
            hang_cas_output: AtomicBool::new(false),
        }
    }

    /// Script for tasks without a queued script.
    pub fn with_default_script(self, states: Vec<TaskState>) -> Self {
        lock(&self.state).default_script = states;
        self
    }

    /// Script for the next triggered task.
    pub fn with_script(self, states: Vec<TaskState>) -> Self {
        lock(&self.state).scripts.push_back(states);
        self
    }

    /// Reject the next `n` triggers with a no-resource error.
    pub fn reject_next_triggers(self, n: usize) -> Self {
        {
            let mut state = lock(&self.state);
            for _ in 0..n {
                state.trigger_failures.push_back(TriggerFailure::NoResource);
            }
        }
        self
    }

    pub fn fail_next_trigger(self, reason: &str) -> Self {
        lock(&self.state)
            .trigger_failures
            .push_back(TriggerFailure::Error(reason.to_string()));
        self
    }

    /// Fail the next `n` status polls.
    pub fn fail_next_polls(self, n: u32) -> Self {
        lock(&self.state).poll_failures = n;
        self
    }

    /// Fail every other status poll, starting with the next one, until `n`
    /// polls have failed.
    pub fn fail_alternate_polls(self, n: u32) -> Self {
        {
            let mut state = lock(&self.state);
            state.alternate_failures = n;
            state.alternate_fail_next = true;
        }
        self
    }

    /// Never return from `get_cas_output`.
    pub fn hang_on_cas_output(self) -> Self {
        self.hang_cas_output.store(true, Ordering::SeqCst);
        self
    }

    /// Every trigger request, including rejected ones.
    pub fn requests(&self) -> Vec<TaskRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn cancel_calls(&self) -> Vec<String> {
        lock(&self.state).cancelled.clone()
    }

    /// Task ids issued so far, in order.
    pub fn task_ids(&self) -> Vec<String> {
        let state = lock(&self.state);
        (1..=state.next_id).map(|n| format!("task-{n}")).collect()
    }
}

#[async_trait]
impl FleetClient for FakeFleet {
    async fn trigger_task(&self, request: &TaskRequest) -> Result<String> {
        let mut state = lock(&self.state);
        state.requests.push(request.clone());
        match state.trigger_failures.pop_front() {
            Some(TriggerFailure::NoResource) => {
                return Err(BisectError::NoResource {
                    reason: "no bot matches the requested dimensions".to_string(),
                })
            }
            Some(TriggerFailure::Error(reason)) => {
                return Err(BisectError::Fleet {
                    operation: "trigger".to_string(),
                    reason,
                })
            }
            None => {}
        }

        state.next_id += 1;
        let task_id = format!("task-{}", state.next_id);
        let script = match state.scripts.pop_front() {
            Some(script) => script,
            None => state.default_script.clone(),
        };
        state.tasks.insert(
            task_id.clone(),
            FakeTask {
                states: script.into(),
                input: request.cas_input.clone(),
            },
        );
        Ok(task_id)
    }

    async fn get_status(&self, task_id: &str) -> Result<TaskState> {
        let mut state = lock(&self.state);
        let alternate = if state.alternate_failures > 0 {
            let fail = state.alternate_fail_next;
            state.alternate_fail_next = !fail;
            if fail {
                state.alternate_failures -= 1;
            }
            fail
        } else {
            false
        };
        if state.poll_failures > 0 || alternate {
            state.poll_failures = state.poll_failures.saturating_sub(1);
            state.poll_failures_seen += 1;
            return Err(BisectError::Fleet {
                operation: "get_status".to_string(),
                reason: format!("injected failure (poll {})", state.poll_failures_seen),
            });
        }
        let task = state.tasks.get_mut(task_id).ok_or_else(|| BisectError::Fleet {
            operation: "get_status".to_string(),
            reason: format!("unknown task {task_id}"),
        })?;
        let current = if task.states.len() > 1 {
            task.states.pop_front()
        } else {
            task.states.front().cloned()
        };
        Ok(current.unwrap_or(TaskState::Pending))
    }

    async fn get_cas_output(&self, task_id: &str) -> Result<CasReference> {
        if self.hang_cas_output.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let state = lock(&self.state);
        let task = state.tasks.get(task_id).ok_or_else(|| BisectError::Fleet {
            operation: "get_cas_output".to_string(),
            reason: format!("unknown task {task_id}"),
        })?;
        Ok(CasReference::new(
            task.input.cas_instance.clone(),
            format!("{}{RESULTS_SUFFIX}", task.input.digest.hash),
            task.input.digest.size_bytes,
        ))
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.cancelled.push(task_id.to_string());
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.states = VecDeque::from([TaskState::Canceled]);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeBuilds / FakeResults
// ---------------------------------------------------------------------------

/// Every commit has a build whose hash is the commit key.
#[derive(Debug, Default, Clone, Copy)]
pub struct FakeBuilds;

#[async_trait]
impl BuildProvider for FakeBuilds {
    async fn find_build(&self, commit: &CombinedCommit) -> Result<CasReference> {
        Ok(CasReference::new("fake-instance", commit.key(), 1))
    }
}

type ValueFn = dyn Fn(&str) -> Vec<f64> + Send + Sync;

/// Sample values keyed by the commit key behind a task's output.
#[derive(Default)]
pub struct FakeResults {
    values: HashMap<String, Vec<f64>>,
    by_key: Option<Box<ValueFn>>,
}

impl FakeResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values computed from the commit key for keys not set explicitly.
    pub fn from_fn(f: impl Fn(&str) -> Vec<f64> + Send + Sync + 'static) -> Self {
        Self {
            values: HashMap::new(),
            by_key: Some(Box::new(f)),
        }
    }

    pub fn with_values(mut self, commit_key: &str, values: Vec<f64>) -> Self {
        self.values.insert(commit_key.to_string(), values);
        self
    }
}

#[async_trait]
impl ResultReader for FakeResults {
    async fn read_values(&self, cas: &CasReference, _benchmark: &str, _chart: &str) -> Result<Vec<f64>> {
        let hash = &cas.digest.hash;
        let key = hash.strip_suffix(RESULTS_SUFFIX).unwrap_or(hash);
        if let Some(values) = self.values.get(key) {
            return Ok(values.clone());
        }
        Ok(self.by_key.as_ref().map(|f| f(key)).unwrap_or_default())
    }
}
