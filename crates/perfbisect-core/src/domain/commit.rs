//! Commit model: single-repository commits and combined commits.
//!
//! All types here are plain values. The control loop replaces its bracket
//! endpoints with new values on every iteration and never mutates one in
//! place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::error::{BisectError, Result};

/// Separator used by [`CombinedCommit::key`]. Never appears in a hex hash.
pub const KEY_SEPARATOR: char = '+';

/// A revision within a named repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commit {
    /// Repository URL, e.g. `https://chromium.googlesource.com/chromium/src`.
    pub repository_url: String,
    /// Full or abbreviated git hash.
    pub git_hash: String,
}

impl Commit {
    pub fn new(repository_url: impl Into<String>, git_hash: impl Into<String>) -> Self {
        Self {
            repository_url: repository_url.into(),
            git_hash: git_hash.into(),
        }
    }

    /// True when both commits name the same repository and one hash is a
    /// prefix of the other (abbreviated vs full hash).
    pub fn matches(&self, other: &Commit) -> bool {
        self.repository_url == other.repository_url
            && hash_matches(&self.git_hash, &other.git_hash)
    }
}

impl std::fmt::Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repository_url, self.git_hash)
    }
}

/// Prefix-tolerant hash equality. Empty hashes never match.
pub fn hash_matches(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.starts_with(b) || b.starts_with(a))
}

/// A main commit plus zero or more pinned-dependency overrides.
///
/// Override repositories are distinct from each other and from the main
/// repository; [`CombinedCommit::with_override`] enforces this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CombinedCommit {
    pub main: Option<Commit>,
    #[serde(default)]
    pub modified_deps: Vec<Commit>,
}

impl CombinedCommit {
    /// A combined commit with no overrides.
    pub fn new(main: Commit) -> Self {
        Self {
            main: Some(main),
            modified_deps: Vec::new(),
        }
    }

    /// Append a dependency override.
    pub fn with_override(mut self, dep: Commit) -> Result<Self> {
        let clashes_main = self
            .main
            .as_ref()
            .is_some_and(|m| m.repository_url == dep.repository_url);
        let clashes_dep = self
            .modified_deps
            .iter()
            .any(|d| d.repository_url == dep.repository_url);
        if clashes_main || clashes_dep {
            return Err(BisectError::DuplicateOverride {
                repository_url: dep.repository_url,
            });
        }
        self.modified_deps.push(dep);
        Ok(self)
    }

    /// Deterministic memoization key: main hash then each override hash,
    /// joined by `+`. Empty when `main` is unset.
    pub fn key(&self) -> String {
        let Some(main) = &self.main else {
            return String::new();
        };
        let mut key = main.git_hash.clone();
        for dep in &self.modified_deps {
            key.push(KEY_SEPARATOR);
            key.push_str(&dep.git_hash);
        }
        key
    }

    /// Overrides as `repository_url -> git_hash`.
    pub fn deps_to_map(&self) -> BTreeMap<String, String> {
        self.modified_deps
            .iter()
            .map(|c| (c.repository_url.clone(), c.git_hash.clone()))
            .collect()
    }

    /// Main git hash, or the empty string when `main` is unset.
    pub fn get_main_git_hash(&self) -> &str {
        self.main.as_ref().map(|m| m.git_hash.as_str()).unwrap_or("")
    }

    /// The commit this combined commit distinguishes itself by: the last
    /// override if any, otherwise the main commit.
    pub fn head(&self) -> Option<&Commit> {
        self.modified_deps.last().or(self.main.as_ref())
    }
}

impl std::fmt::Display for CombinedCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.main {
            Some(main) => write!(f, "{main}")?,
            None => write!(f, "<unset>")?,
        }
        for dep in &self.modified_deps {
            write!(f, " [{dep}]")?;
        }
        Ok(())
    }
}

/// The current search bracket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRange {
    pub low: CombinedCommit,
    pub high: CombinedCommit,
}

impl CommitRange {
    pub fn new(low: CombinedCommit, high: CombinedCommit) -> Self {
        Self { low, high }
    }

    /// Checks if the low main git hash is set.
    pub fn has_left_hash(&self) -> bool {
        !self.low.get_main_git_hash().is_empty()
    }

    /// Checks if the high main git hash is set.
    pub fn has_right_hash(&self) -> bool {
        !self.high.get_main_git_hash().is_empty()
    }
}
