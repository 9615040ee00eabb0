//! Remote execution fleet boundary: task states, task requests and the
//! [`FleetClient`] trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::Result;

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// State of a fleet task.
///
/// `Pending -> Running -> {Completed, BotDied, TimedOut, Canceled, ...}`.
/// `Completed` is the only success. `NoResource` means no live bot matched
/// the task's dimensions and is the only state that triggers rescheduling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    BotDied,
    TimedOut,
    Canceled,
    Expired,
    Killed,
    NoResource,
    ClientError,
    /// A state string this client does not know about.
    Unknown(String),
}

impl TaskState {
    pub fn as_str(&self) -> &str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::BotDied => "BOT_DIED",
            TaskState::TimedOut => "TIMED_OUT",
            TaskState::Canceled => "CANCELED",
            TaskState::Expired => "EXPIRED",
            TaskState::Killed => "KILLED",
            TaskState::NoResource => "NO_RESOURCE",
            TaskState::ClientError => "CLIENT_ERROR",
            TaskState::Unknown(s) => s.as_str(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TaskState::Pending)
    }

    /// The task will not change state again.
    pub fn is_finished(&self) -> bool {
        !matches!(
            self,
            TaskState::Pending | TaskState::Running | TaskState::Unknown(_)
        )
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, TaskState::Completed)
    }

    /// Finished on a bot without producing a result.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            TaskState::BotDied | TaskState::Canceled | TaskState::TimedOut | TaskState::Killed
        )
    }

    pub fn is_no_resource(&self) -> bool {
        matches!(self, TaskState::NoResource)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "PENDING" => TaskState::Pending,
            "RUNNING" => TaskState::Running,
            "COMPLETED" => TaskState::Completed,
            "BOT_DIED" => TaskState::BotDied,
            "TIMED_OUT" => TaskState::TimedOut,
            "CANCELED" => TaskState::Canceled,
            "EXPIRED" => TaskState::Expired,
            "KILLED" => TaskState::Killed,
            "NO_RESOURCE" => TaskState::NoResource,
            "CLIENT_ERROR" => TaskState::ClientError,
            other => TaskState::Unknown(other.to_string()),
        })
    }
}

impl From<String> for TaskState {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(state) => state,
            Err(never) => match never {},
        }
    }
}

impl From<TaskState> for String {
    fn from(state: TaskState) -> Self {
        state.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// CAS references
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CasDigest {
    pub hash: String,
    #[serde(default)]
    pub size_bytes: i64,
}

/// Location of an artifact in content-addressed storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CasReference {
    pub cas_instance: String,
    pub digest: CasDigest,
}

impl CasReference {
    pub fn new(cas_instance: impl Into<String>, hash: impl Into<String>, size_bytes: i64) -> Self {
        Self {
            cas_instance: cas_instance.into(),
            digest: CasDigest {
                hash: hash.into(),
                size_bytes,
            },
        }
    }
}

impl std::fmt::Display for CasReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.cas_instance, self.digest.hash, self.digest.size_bytes
        )
    }
}

// ---------------------------------------------------------------------------
// TaskRequest
// ---------------------------------------------------------------------------

/// Everything the fleet needs to run one benchmark iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub name: String,
    /// Bot selection, e.g. `pool`, `os`, and an optional pinned `id`.
    pub dimensions: BTreeMap<String, String>,
    pub cas_input: CasReference,
    pub command: Vec<String>,
    pub tags: Vec<String>,
    pub priority: i32,
    pub execution_timeout_secs: u64,
    pub expiration_secs: u64,
}

/// Parameters that produce a [`TaskRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    pub job_id: String,
    /// `CombinedCommit::key()` of the commit under test.
    pub commit_key: String,
    pub bot_config: String,
    pub benchmark: String,
    pub story: String,
    pub story_tags: Option<String>,
    pub build: CasReference,
    pub pool: String,
    /// Pin the task to one bot; cleared after a no-resource retry.
    pub bot_id: Option<String>,
}

impl TaskParams {
    pub fn to_request(&self) -> TaskRequest {
        let mut dimensions = BTreeMap::new();
        dimensions.insert("pool".to_string(), self.pool.clone());
        dimensions.insert("bot_config".to_string(), self.bot_config.clone());
        if let Some(bot_id) = &self.bot_id {
            dimensions.insert("id".to_string(), bot_id.clone());
        }

        let mut command = vec![
            "luci-auth".to_string(),
            "context".to_string(),
            "--".to_string(),
            "vpython3".to_string(),
            "../../testing/test_env.py".to_string(),
            "../../tools/perf/run_benchmark".to_string(),
            "-v".to_string(),
            "--upload-results".to_string(),
            "--output-format=histograms".to_string(),
            format!("--benchmarks={}", self.benchmark),
            format!("--browser={}", browser_for(&self.bot_config)),
            "--pageset-repeat=1".to_string(),
            format!("--results-label={}", short_hash(&self.commit_key)),
            "--isolated-script-test-output=${ISOLATED_OUTDIR}/output.json".to_string(),
        ];
        if !self.story.is_empty() {
            command.push(format!("--story-filter=^{}$", regex_escape(&self.story)));
        }
        if let Some(tags) = self.story_tags.as_deref().filter(|t| !t.is_empty()) {
            command.push(format!("--story-tag-filter={tags}"));
        }

        TaskRequest {
            name: format!("perfbisect-{}-{}", self.job_id, short_hash(&self.commit_key)),
            dimensions,
            cas_input: self.build.clone(),
            command,
            tags: vec![
                format!("job_id:{}", self.job_id),
                format!("commit:{}", self.commit_key),
                format!("benchmark:{}", self.benchmark),
                format!("story:{}", self.story),
            ],
            priority: 100,
            execution_timeout_secs: 2700,
            expiration_secs: 86_400,
        }
    }
}

fn browser_for(bot_config: &str) -> &'static str {
    if bot_config.contains("android") {
        "android-chrome"
    } else {
        "release"
    }
}

fn short_hash(key: &str) -> &str {
    key.get(..7).unwrap_or(key)
}

fn regex_escape(story: &str) -> String {
    let mut out = String::with_capacity(story.len());
    for c in story.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ---------------------------------------------------------------------------
// FleetClient
// ---------------------------------------------------------------------------

/// Submit/poll/cancel access to the remote execution fleet.
///
/// Each task id is owned by the caller that triggered it.
#[async_trait]
pub trait FleetClient: Send + Sync {
    /// Submit a task. Returns `BisectError::NoResource` when the fleet
    /// rejects the task because no live bot matches its dimensions.
    async fn trigger_task(&self, request: &TaskRequest) -> Result<String>;

    async fn get_status(&self, task_id: &str) -> Result<TaskState>;

    /// Output artifact of a completed task.
    async fn get_cas_output(&self, task_id: &str) -> Result<CasReference>;

    /// Best-effort cancel, killing the task if it is already running.
    async fn cancel(&self, task_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_states() {
        for s in [TaskState::Completed, TaskState::BotDied, TaskState::TimedOut] {
            assert!(s.is_finished(), "{s}");
        }
        for s in [TaskState::Pending, TaskState::Running] {
            assert!(!s.is_finished(), "{s}");
        }
    }

    #[test]
    fn only_completed_is_successful() {
        assert!(TaskState::Completed.is_successful());
        for s in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::BotDied,
            TaskState::Canceled,
            TaskState::TimedOut,
        ] {
            assert!(!s.is_successful(), "{s}");
        }
    }

    #[test]
    fn terminal_failures_exclude_no_resource() {
        for s in [TaskState::BotDied, TaskState::Canceled, TaskState::TimedOut] {
            assert!(s.is_terminal_failure(), "{s}");
        }
        for s in [
            TaskState::Running,
            TaskState::Completed,
            TaskState::NoResource,
            TaskState::Unknown("RUN_BENCHMARK_FAILURE".to_string()),
        ] {
            assert!(!s.is_terminal_failure(), "{s}");
        }
        assert!(TaskState::NoResource.is_no_resource());
        assert!(TaskState::NoResource.is_finished());
    }

    #[test]
    fn state_strings_round_trip_through_serde() {
        let json = serde_json::to_string(&TaskState::BotDied).unwrap();
        assert_eq!(json, "\"BOT_DIED\"");
        let back: TaskState = serde_json::from_str("\"NO_RESOURCE\"").unwrap();
        assert_eq!(back, TaskState::NoResource);
        let odd: TaskState = serde_json::from_str("\"WEIRD\"").unwrap();
        assert_eq!(odd, TaskState::Unknown("WEIRD".to_string()));
        assert!(!odd.is_finished());
    }

    fn params() -> TaskParams {
        TaskParams {
            job_id: "job-1".to_string(),
            commit_key: "64893ca6294946163615dcf23b614afe0419bfa3".to_string(),
            bot_config: "android-pixel2_webview-perf".to_string(),
            benchmark: "performance_browser_tests".to_string(),
            story: "story.one".to_string(),
            story_tags: Some("all".to_string()),
            build: CasReference::new("instance", "hash", 0),
            pool: "chrome.tests.pinpoint".to_string(),
            bot_id: Some("fake-botid-h7".to_string()),
        }
    }

    #[test]
    fn request_pins_bot_and_tags_commit() {
        let req = params().to_request();
        assert_eq!(req.dimensions.get("id").map(String::as_str), Some("fake-botid-h7"));
        assert!(req.command.contains(&"--benchmarks=performance_browser_tests".to_string()));
        assert!(req.command.contains(&"--story-filter=^story\\.one$".to_string()));
        assert!(req.command.contains(&"--browser=android-chrome".to_string()));
        assert!(req.command.contains(&"--results-label=64893ca".to_string()));
        assert!(req.tags.contains(&"job_id:job-1".to_string()));
        assert_eq!(req.cas_input.digest.hash, "hash");
    }

    #[test]
    fn request_without_pin_has_no_id_dimension() {
        let mut p = params();
        p.bot_id = None;
        assert!(!p.to_request().dimensions.contains_key("id"));
    }
}
