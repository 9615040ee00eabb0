//! Build artifacts in, benchmark samples out.
//!
//! [`BuildProvider`] maps a combined commit to the CAS artifact a task runs;
//! [`ResultReader`] reads chart values back out of a finished task's output.
//! The file-backed implementations read a prebuilt-artifact manifest and a
//! local mirror of task outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{hash_matches, BisectError, CombinedCommit, Result};
use crate::fleet::{CasDigest, CasReference};

#[async_trait]
pub trait BuildProvider: Send + Sync {
    async fn find_build(&self, commit: &CombinedCommit) -> Result<CasReference>;
}

#[async_trait]
pub trait ResultReader: Send + Sync {
    /// Values of `chart` in the output at `cas`. A chart the output does
    /// not contain yields no values.
    async fn read_values(&self, cas: &CasReference, benchmark: &str, chart: &str) -> Result<Vec<f64>>;
}

// ---------------------------------------------------------------------------
// ManifestBuilds
// ---------------------------------------------------------------------------

/// Builds listed in a JSON manifest: `{ "<commit key>": {"hash", "size_bytes"} }`.
#[derive(Debug, Clone)]
pub struct ManifestBuilds {
    cas_instance: String,
    builds: BTreeMap<String, CasDigest>,
}

impl ManifestBuilds {
    pub fn from_json(json: &str, cas_instance: &str) -> Result<Self> {
        let builds = serde_json::from_str(json)?;
        Ok(Self {
            cas_instance: cas_instance.to_string(),
            builds,
        })
    }

    pub async fn from_file(path: &Path, cas_instance: &str) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BisectError::Build {
                commit: String::new(),
                reason: format!("failed to read {}: {e}", path.display()),
            })?;
        Self::from_json(&json, cas_instance)
    }

    pub fn len(&self) -> usize {
        self.builds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }

    /// Exact key first, then a unique abbreviated-hash match.
    fn lookup(&self, key: &str) -> std::result::Result<&CasDigest, String> {
        if let Some(digest) = self.builds.get(key) {
            return Ok(digest);
        }
        let wanted: Vec<&str> = key.split(crate::domain::commit::KEY_SEPARATOR).collect();
        let mut matches = self.builds.iter().filter(|(k, _)| {
            let parts: Vec<&str> = k.split(crate::domain::commit::KEY_SEPARATOR).collect();
            parts.len() == wanted.len() && parts.iter().zip(&wanted).all(|(a, b)| hash_matches(a, b))
        });
        match (matches.next(), matches.next()) {
            (Some((_, digest)), None) => Ok(digest),
            (None, _) => Err(format!("no prebuilt artifact for key {key}")),
            (Some((first, _)), Some((second, _))) => Err(format!(
                "key {key} is ambiguous: matches {first} and {second}"
            )),
        }
    }
}

#[async_trait]
impl BuildProvider for ManifestBuilds {
    async fn find_build(&self, commit: &CombinedCommit) -> Result<CasReference> {
        let key = commit.key();
        let digest = self.lookup(&key).map_err(|reason| BisectError::Build {
            commit: commit.to_string(),
            reason,
        })?;
        Ok(CasReference {
            cas_instance: self.cas_instance.clone(),
            digest: digest.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// ResultsDir
// ---------------------------------------------------------------------------

/// Task outputs mirrored to disk as `{dir}/{digest hash}.json`.
///
/// Each file is `{ "<chart>": [values] }`, optionally nested under the
/// benchmark name.
#[derive(Debug, Clone)]
pub struct ResultsDir {
    dir: PathBuf,
}

impl ResultsDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ResultReader for ResultsDir {
    async fn read_values(&self, cas: &CasReference, benchmark: &str, chart: &str) -> Result<Vec<f64>> {
        let err = |reason: String| BisectError::Results {
            digest: cas.digest.hash.clone(),
            chart: chart.to_string(),
            reason,
        };
        let path = self.dir.join(format!("{}.json", cas.digest.hash));
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| err(format!("failed to read {}: {e}", path.display())))?;
        let doc: serde_json::Value = serde_json::from_str(&raw).map_err(|e| err(e.to_string()))?;

        let values = doc
            .get(benchmark)
            .and_then(|b| b.get(chart))
            .or_else(|| doc.get(chart));
        let Some(values) = values else {
            debug!(digest = %cas.digest.hash, chart = %chart, "chart missing from results");
            return Ok(Vec::new());
        };
        serde_json::from_value(values.clone()).map_err(|e| err(e.to_string()))
    }
}
