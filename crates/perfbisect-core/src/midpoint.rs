//! Midpoint resolution over linear history, descending one level into a
//! rolled dependency when two outer commits are adjacent.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::deps::fetch_git_deps;
use crate::domain::{hash_matches, BisectError, CombinedCommit, Commit, CommitRange, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::source::RepoProvider;

/// A dependency that changed between two adjacent outer commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRoll {
    /// Lower outer commit with the dependency pinned to `mid`.
    pub next: CombinedCommit,
    /// Sub-midpoint in the dependency repository.
    pub mid: Commit,
    /// Dependency revision pinned by the lower outer commit.
    pub left: Commit,
    /// Dependency revision pinned by the upper outer commit.
    pub right: Commit,
}

/// Outcome of one narrowing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RangeStep {
    /// The bracket cannot be split further; `culprit` is the upper end.
    Adjacent { culprit: Commit },
    /// Run `mid` next. `range` is the bracket `mid` splits, which differs
    /// from the input after descending into a dependency.
    Candidate { mid: CombinedCommit, range: CommitRange },
}

pub struct MidpointResolver {
    repos: Arc<dyn RepoProvider>,
}

impl MidpointResolver {
    pub fn new(repos: Arc<dyn RepoProvider>) -> Self {
        Self { repos }
    }

    /// Chronological midpoint strictly between `start` and `end`.
    ///
    /// Returns `start` itself when the two are adjacent.
    pub async fn find_midpoint(&self, repository_url: &str, start: &str, end: &str) -> Result<String> {
        if start == end {
            return Err(BisectError::InvalidRange {
                repository_url: repository_url.to_string(),
                revision: start.to_string(),
            });
        }

        let repo = self.repos.get_or_create(repository_url)?;
        let log = repo.log_linear(start, end).await?;
        let empty = || BisectError::EmptyHistory {
            repository_url: repository_url.to_string(),
            start: start.to_string(),
            end: end.to_string(),
        };

        if log.is_empty() {
            return Err(empty());
        }
        if log.len() == 1 && hash_matches(&log[0].hash, end) {
            debug!(repo = %repository_url, start = %start, end = %end, "adjacent commits");
            return Ok(start.to_string());
        }

        // Newest first and led by `end`; drop it and walk oldest first.
        let mut between: Vec<String> = log.into_iter().skip(1).map(|c| c.hash).collect();
        if between.is_empty() {
            return Err(empty());
        }
        between.reverse();
        let idx = between.len() / 2;
        Ok(between.swap_remove(idx))
    }

    /// Compare the manifests at two adjacent commits and bisect the first
    /// rolled dependency. `None` when no dependency changed.
    pub async fn resolve_dependency_roll(
        &self,
        repository_url: &str,
        start: &str,
        end: &str,
    ) -> Result<Option<DependencyRoll>> {
        let repo = self.repos.get_or_create(repository_url)?;
        let start_deps = fetch_git_deps(repo.as_ref(), start).await?;
        let end_deps = fetch_git_deps(repo.as_ref(), end).await?;

        let Some((dep_url, left_rev)) = start_deps.first_rolled(&end_deps) else {
            return Ok(None);
        };
        let Some(right_rev) = end_deps.get(dep_url) else {
            return Ok(None);
        };
        obs::emit_dependency_roll(dep_url, left_rev, right_rev);

        let sub_mid = self.find_midpoint(dep_url, left_rev, right_rev).await?;
        let mid = Commit::new(dep_url, sub_mid);
        let next = CombinedCommit::new(Commit::new(repository_url, start)).with_override(mid.clone())?;
        Ok(Some(DependencyRoll {
            next,
            mid,
            left: Commit::new(dep_url, left_rev),
            right: Commit::new(dep_url, right_rev),
        }))
    }

    /// Midpoint between two commits of one repository.
    ///
    /// For adjacent commits this is the rolled dependency's sub-midpoint,
    /// or `start` unchanged when nothing rolled.
    pub async fn find_mid_commit(&self, start: &Commit, end: &Commit) -> Result<Commit> {
        let (mid, _) = self.mid_commit_detail(start, end).await?;
        Ok(mid)
    }

    async fn mid_commit_detail(
        &self,
        start: &Commit,
        end: &Commit,
    ) -> Result<(Commit, Option<DependencyRoll>)> {
        if start.repository_url != end.repository_url {
            return Err(BisectError::CrossRepository {
                start_repository: start.repository_url.clone(),
                end_repository: end.repository_url.clone(),
            });
        }

        let url = &start.repository_url;
        let next = self.find_midpoint(url, &start.git_hash, &end.git_hash).await?;
        if !hash_matches(&next, &start.git_hash) {
            return Ok((Commit::new(url.as_str(), next), None));
        }

        match self
            .resolve_dependency_roll(url, &start.git_hash, &end.git_hash)
            .await?
        {
            None => Ok((start.clone(), None)),
            Some(roll) => Ok((roll.mid.clone(), Some(roll))),
        }
    }

    /// Revision of `dependency_url` pinned by `commit`'s manifest.
    pub async fn find_deps_commit(&self, commit: &Commit, dependency_url: &str) -> Result<Commit> {
        let repo = self.repos.get_or_create(&commit.repository_url)?;
        let deps = fetch_git_deps(repo.as_ref(), &commit.git_hash).await?;
        deps.get(dependency_url)
            .map(|rev| Commit::new(dependency_url, rev))
            .ok_or_else(|| BisectError::DependencyNotFound {
                repository_url: commit.repository_url.clone(),
                revision: commit.git_hash.clone(),
                dependency: dependency_url.to_string(),
            })
    }

    /// Decide what the control loop does next with `range`.
    ///
    /// A bracket is either two plain commits of one repository, or (after
    /// a dependency roll) two commits sharing `main` that override the same
    /// dependency. Recursion stops at the dependency level.
    pub async fn find_next_candidate(&self, range: &CommitRange) -> Result<RangeStep> {
        let (Some(low_main), Some(high_main)) = (range.low.main.as_ref(), range.high.main.as_ref())
        else {
            return Err(invalid_range(range));
        };

        let step = match (range.low.modified_deps.as_slice(), range.high.modified_deps.as_slice()) {
            ([], []) => self.outer_step(range, low_main, high_main).await?,
            ([low_dep], [high_dep])
                if low_main == high_main && low_dep.repository_url == high_dep.repository_url =>
            {
                let sub_mid = self
                    .find_midpoint(&low_dep.repository_url, &low_dep.git_hash, &high_dep.git_hash)
                    .await?;
                if hash_matches(&sub_mid, &low_dep.git_hash) {
                    RangeStep::Adjacent {
                        culprit: high_dep.clone(),
                    }
                } else {
                    let mid = CombinedCommit::new(low_main.clone())
                        .with_override(Commit::new(low_dep.repository_url.as_str(), sub_mid))?;
                    RangeStep::Candidate {
                        mid,
                        range: range.clone(),
                    }
                }
            }
            _ => return Err(invalid_range(range)),
        };

        if let RangeStep::Candidate { mid, range } = &step {
            METRICS.inc_midpoints_resolved();
            obs::emit_midpoint_resolved(&range.low.to_string(), &range.high.to_string(), &mid.to_string());
        }
        Ok(step)
    }

    async fn outer_step(&self, range: &CommitRange, low: &Commit, high: &Commit) -> Result<RangeStep> {
        let (mid, roll) = self.mid_commit_detail(low, high).await?;
        let Some(roll) = roll else {
            if mid == *low {
                return Ok(RangeStep::Adjacent {
                    culprit: high.clone(),
                });
            }
            return Ok(RangeStep::Candidate {
                mid: CombinedCommit::new(mid),
                range: range.clone(),
            });
        };

        // The rolled dependency's own endpoints are adjacent.
        if hash_matches(&roll.mid.git_hash, &roll.left.git_hash) {
            return Ok(RangeStep::Adjacent { culprit: roll.right });
        }
        let narrowed = CommitRange::new(
            CombinedCommit::new(low.clone()).with_override(roll.left)?,
            CombinedCommit::new(low.clone()).with_override(roll.right)?,
        );
        Ok(RangeStep::Candidate {
            mid: roll.next,
            range: narrowed,
        })
    }
}

fn invalid_range(range: &CommitRange) -> BisectError {
    BisectError::InvalidRange {
        repository_url: range
            .low
            .main
            .as_ref()
            .map(|c| c.repository_url.clone())
            .unwrap_or_default(),
        revision: range.low.key(),
    }
}
