//! Bisection requests as accepted by the job service.

use serde::{Deserialize, Serialize};

use crate::domain::commit::Commit;
use crate::domain::error::{BisectError, Result};
use crate::domain::run::AggregationMethod;

/// Repository bisected when a request does not name one.
pub const DEFAULT_REPOSITORY: &str = "https://chromium.googlesource.com/chromium/src";

const MISSING_PARAM: &str = "Missing required param";

fn default_repository() -> String {
    DEFAULT_REPOSITORY.to_string()
}

/// A request to find the culprit between two revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BisectRequest {
    pub start_git_hash: String,
    pub end_git_hash: String,
    pub benchmark: String,
    pub story: String,
    /// Metric compared between runs.
    pub chart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_method: Option<AggregationMethod>,
    /// Minimum absolute difference worth reporting. Empty means the
    /// configured default.
    #[serde(default)]
    pub comparison_magnitude: String,
    /// Bot configuration, e.g. `linux-perf`.
    pub configuration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_tags: Option<String>,
    #[serde(default = "default_repository")]
    pub repository_url: String,
}

impl BisectRequest {
    pub fn new(
        start_git_hash: impl Into<String>,
        end_git_hash: impl Into<String>,
        benchmark: impl Into<String>,
        story: impl Into<String>,
        chart: impl Into<String>,
        configuration: impl Into<String>,
    ) -> Self {
        Self {
            start_git_hash: start_git_hash.into(),
            end_git_hash: end_git_hash.into(),
            benchmark: benchmark.into(),
            story: story.into(),
            chart: chart.into(),
            aggregation_method: None,
            comparison_magnitude: String::new(),
            configuration: configuration.into(),
            story_tags: None,
            repository_url: default_repository(),
        }
    }

    pub fn with_magnitude(mut self, magnitude: impl Into<String>) -> Self {
        self.comparison_magnitude = magnitude.into();
        self
    }

    pub fn with_repository(mut self, url: impl Into<String>) -> Self {
        self.repository_url = url.into();
        self
    }

    pub fn with_aggregation(mut self, method: AggregationMethod) -> Self {
        self.aggregation_method = Some(method);
        self
    }

    pub fn with_story_tags(mut self, tags: impl Into<String>) -> Self {
        self.story_tags = Some(tags.into());
        self
    }

    /// Report the first problem with the request, if any.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("start commit", &self.start_git_hash),
            ("end commit", &self.end_git_hash),
            ("configuration", &self.configuration),
            ("benchmark", &self.benchmark),
            ("story", &self.story),
            ("chart", &self.chart),
            ("repository", &self.repository_url),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(BisectError::InvalidRequest(format!("{MISSING_PARAM} {name}")));
            }
        }
        if !self.comparison_magnitude.trim().is_empty() {
            self.magnitude(1.0)?;
        }
        if self.start_git_hash == self.end_git_hash {
            return Err(BisectError::InvalidRange {
                repository_url: self.repository_url.clone(),
                revision: self.start_git_hash.clone(),
            });
        }
        Ok(())
    }

    /// Parsed comparison magnitude, or `default` when none was given.
    pub fn magnitude(&self, default: f64) -> Result<f64> {
        let raw = self.comparison_magnitude.trim();
        if raw.is_empty() {
            return Ok(default);
        }
        let value: f64 = raw.parse().map_err(|_| {
            BisectError::InvalidRequest(format!("comparison magnitude {raw:?} is not a number"))
        })?;
        if !value.is_finite() || value <= 0.0 {
            return Err(BisectError::InvalidRequest(format!(
                "comparison magnitude must be positive, got {value}"
            )));
        }
        Ok(value)
    }

    pub fn start_commit(&self) -> Commit {
        Commit::new(&self.repository_url, &self.start_git_hash)
    }

    pub fn end_commit(&self) -> Commit {
        Commit::new(&self.repository_url, &self.end_git_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BisectRequest {
        BisectRequest::new("aaa", "bbb", "speedometer3", "Speedometer3", "Score", "linux-perf")
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate().is_ok());
        assert_eq!(request().repository_url, DEFAULT_REPOSITORY);
    }

    #[test]
    fn missing_fields_are_reported_in_order() {
        let mut req = request();
        req.start_git_hash.clear();
        req.chart.clear();
        let err = req.validate().unwrap_err();
        assert_eq!(err.to_string(), "Missing required param start commit");

        let mut req = request();
        req.story.clear();
        let err = req.validate().unwrap_err();
        assert_eq!(err.to_string(), "Missing required param story");
    }

    #[test]
    fn magnitude_defaults_and_rejects_garbage() {
        assert_eq!(request().magnitude(1.0).unwrap(), 1.0);
        assert_eq!(request().with_magnitude("2.5").magnitude(1.0).unwrap(), 2.5);
        assert!(request().with_magnitude("abc").validate().is_err());
        assert!(request().with_magnitude("-1").validate().is_err());
        assert!(request().with_magnitude("0").validate().is_err());
    }

    #[test]
    fn identical_endpoints_are_rejected() {
        let req = BisectRequest::new("aaa", "aaa", "b", "s", "c", "linux-perf");
        assert!(matches!(
            req.validate().unwrap_err(),
            BisectError::InvalidRange { .. }
        ));
    }

    #[test]
    fn repository_defaults_when_deserializing() {
        let req: BisectRequest = serde_json::from_value(serde_json::json!({
            "start_git_hash": "aaa",
            "end_git_hash": "bbb",
            "benchmark": "b",
            "story": "s",
            "chart": "c",
            "configuration": "linux-perf",
        }))
        .unwrap();
        assert_eq!(req.repository_url, DEFAULT_REPOSITORY);
        assert_eq!(req.start_commit().git_hash, "aaa");
    }
}
