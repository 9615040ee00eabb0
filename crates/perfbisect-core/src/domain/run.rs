//! Benchmark run results and the terminal bisection record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::commit::{CombinedCommit, Commit};
use crate::domain::error::{BisectError, Result};
use crate::fleet::{CasReference, TaskState};

/// One benchmark task's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub task_id: String,
    pub status: TaskState,
    /// Output artifact; only set when `status` is successful.
    pub cas: Option<CasReference>,
    /// Number of submissions it took to get the task onto a bot.
    pub attempts: u32,
}

impl TestRun {
    pub fn is_successful(&self) -> bool {
        self.status.is_successful() && self.cas.is_some()
    }
}

/// How each run's values are reduced before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Mean,
    Min,
    Max,
    Sum,
    Count,
    Std,
}

impl AggregationMethod {
    /// Reduce `values` to one number. Empty input stays empty.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let sum: f64 = values.iter().sum();
        Some(match self {
            AggregationMethod::Mean => sum / n,
            AggregationMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregationMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregationMethod::Sum => sum,
            AggregationMethod::Count => n,
            AggregationMethod::Std => {
                if values.len() < 2 {
                    0.0
                } else {
                    let mean = sum / n;
                    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                    var.sqrt()
                }
            }
        })
    }
}

impl std::str::FromStr for AggregationMethod {
    type Err = BisectError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(Self::Mean),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "sum" => Ok(Self::Sum),
            "count" => Ok(Self::Count),
            "std" => Ok(Self::Std),
            other => Err(BisectError::InvalidRequest(format!(
                "unknown aggregation method: {other}"
            ))),
        }
    }
}

/// All benchmark samples collected at one combined commit.
///
/// Never mutated after creation; a new commit gets a new `CommitRun`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRun {
    pub commit: CombinedCommit,
    pub runs: Vec<TestRun>,
    /// chart -> values, concatenated across successful runs.
    pub values: BTreeMap<String, Vec<f64>>,
}

impl CommitRun {
    /// Every sample for `chart`. Failed runs contribute nothing.
    pub fn all_values(&self, chart: &str) -> Vec<f64> {
        self.values.get(chart).cloned().unwrap_or_default()
    }

    pub fn successful_runs(&self) -> usize {
        self.runs.iter().filter(|r| r.is_successful()).count()
    }
}

/// Terminal result of one bisection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BisectionExecution {
    pub job_id: String,
    /// Set once when a regression was localized; absent otherwise.
    pub culprit: Option<Commit>,
}
