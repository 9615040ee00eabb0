//! Read-only source-control boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{BisectError, Result};

/// One entry of a commit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Full hash.
    pub hash: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub subject: String,
}

/// Commit-log and file access for one repository.
///
/// Inputs may be full or abbreviated hashes; results carry full hashes.
#[async_trait]
pub trait SourceRepo: Send + Sync {
    /// Repository URL this client reads.
    fn url(&self) -> &str;

    /// Commits in `range` (`a..b` syntax), newest first.
    async fn log(&self, range: &str) -> Result<Vec<CommitInfo>>;

    /// First-parent commits after `start` up to and including `end`,
    /// newest first.
    async fn log_linear(&self, start: &str, end: &str) -> Result<Vec<CommitInfo>>;

    /// Raw file content at a revision.
    async fn read_file_at_ref(&self, path: &str, revision: &str) -> Result<Vec<u8>>;
}

/// Maps a repository URL to a client for it.
pub trait RepoProvider: Send + Sync {
    fn get_or_create(&self, url: &str) -> Result<Arc<dyn SourceRepo>>;
}

type RepoFactory = dyn Fn(&str) -> Result<Arc<dyn SourceRepo>> + Send + Sync;

/// Provider that builds clients on first use and caches them by URL.
pub struct CachingRepoProvider {
    repos: Mutex<HashMap<String, Arc<dyn SourceRepo>>>,
    factory: Box<RepoFactory>,
}

impl CachingRepoProvider {
    pub fn new(
        factory: impl Fn(&str) -> Result<Arc<dyn SourceRepo>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            repos: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Pre-register a client for `url`.
    pub fn with_repo(self, url: &str, repo: Arc<dyn SourceRepo>) -> Self {
        if let Ok(mut repos) = self.repos.lock() {
            repos.insert(url.to_string(), repo);
        }
        self
    }
}

impl RepoProvider for CachingRepoProvider {
    fn get_or_create(&self, url: &str) -> Result<Arc<dyn SourceRepo>> {
        let mut repos = self.repos.lock().map_err(|e| BisectError::SourceControl {
            repository_url: url.to_string(),
            reason: format!("repo cache poisoned: {e}"),
        })?;
        if let Some(repo) = repos.get(url) {
            return Ok(Arc::clone(repo));
        }
        let repo = (self.factory)(url)?;
        repos.insert(url.to_string(), Arc::clone(&repo));
        Ok(repo)
    }
}
