//! Comparison gate: are two sample sets meaningfully different?
//!
//! The gate is a pure function. A pair is `Same` when the mean difference
//! is below the requested magnitude or the rank test is clearly
//! insignificant, `Different` when the difference is both large enough and
//! significant, and `Unknown` in between or when a side has no samples.
//!
//! Significance uses a two-sided Mann-Whitney U test with the normal
//! approximation and tie correction.

use serde::{Deserialize, Serialize};

use crate::domain::{BisectError, Result};

/// At or below this p-value the samples are different.
pub const LOW_THRESHOLD: f64 = 0.05;
/// At or above this p-value the samples are the same.
pub const HIGH_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Same,
    Different,
    Unknown,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Verdict::Same => "same",
            Verdict::Different => "different",
            Verdict::Unknown => "unknown",
        })
    }
}

/// Verdict plus the numbers behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub verdict: Verdict,
    pub p_value: f64,
    pub mean_a: f64,
    pub mean_b: f64,
    pub n_a: usize,
    pub n_b: usize,
}

impl ComparisonResult {
    /// The control loop's reading of a verdict. `Unknown` counts as no
    /// difference.
    pub fn is_different(&self) -> bool {
        self.verdict == Verdict::Different
    }
}

/// Zero for an empty side, so results stay serializable.
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Classify two sample sets at the given minimum magnitude.
pub fn compare(a: &[f64], b: &[f64], magnitude: f64) -> Result<ComparisonResult> {
    if !magnitude.is_finite() || magnitude < 0.0 {
        return Err(BisectError::Comparison(format!(
            "magnitude must be a non-negative number, got {magnitude}"
        )));
    }
    if a.iter().chain(b).any(|v| !v.is_finite()) {
        return Err(BisectError::Comparison(
            "samples must be finite numbers".to_string(),
        ));
    }

    let mut result = ComparisonResult {
        verdict: Verdict::Unknown,
        p_value: 1.0,
        mean_a: mean(a),
        mean_b: mean(b),
        n_a: a.len(),
        n_b: b.len(),
    };

    if a.is_empty() || b.is_empty() {
        return Ok(result);
    }

    if (result.mean_a - result.mean_b).abs() < magnitude {
        result.verdict = Verdict::Same;
        return Ok(result);
    }

    result.p_value = mann_whitney_p(a, b);
    result.verdict = if result.p_value <= LOW_THRESHOLD {
        Verdict::Different
    } else if result.p_value >= HIGH_THRESHOLD {
        Verdict::Same
    } else {
        Verdict::Unknown
    };
    Ok(result)
}

/// Two-sided p-value of the Mann-Whitney U test (normal approximation).
fn mann_whitney_p(a: &[f64], b: &[f64]) -> f64 {
    let n1 = a.len() as f64;
    let n2 = b.len() as f64;
    let n = n1 + n2;

    let mut pooled: Vec<(f64, bool)> = a
        .iter()
        .map(|&v| (v, true))
        .chain(b.iter().map(|&v| (v, false)))
        .collect();
    pooled.sort_by(|x, y| x.0.total_cmp(&y.0));

    // Average ranks over ties; accumulate the tie correction term.
    let mut rank_sum_a = 0.0;
    let mut tie_term = 0.0;
    let mut i = 0;
    while i < pooled.len() {
        let mut j = i;
        while j + 1 < pooled.len() && pooled[j + 1].0 == pooled[i].0 {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        let t = (j - i + 1) as f64;
        tie_term += t * t * t - t;
        rank_sum_a += pooled[i..=j].iter().filter(|p| p.1).count() as f64 * avg_rank;
        i = j + 1;
    }

    let u = rank_sum_a - n1 * (n1 + 1.0) / 2.0;
    let mu = n1 * n2 / 2.0;
    let variance = n1 * n2 / 12.0 * ((n + 1.0) - tie_term / (n * (n - 1.0)));
    if variance <= 0.0 {
        return 1.0;
    }
    let z = (u - mu) / variance.sqrt();
    (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0)
}

fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Error function approximation
fn erf(x: f64) -> f64 {
    // Abramowitz and Stegun approximation (7.1.26)
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x >= 0.0 { 1.0 } else { -1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}
