//! Engine configuration, read from `PERFBISECT_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{BisectError, Result};

/// Iteration counts per commit run. Only the first entry is used today; the
/// rest are the resampling schedule for an inconclusive comparison.
pub const BENCHMARK_RUN_ITERATIONS: [u32; 5] = [10, 20, 40, 60, 120];

const DEFAULT_SWARMING_URL: &str = "https://chrome-swarming.appspot.com";
const DEFAULT_SWARMING_POOL: &str = "chrome.tests.pinpoint";
const DEFAULT_CAS_INSTANCE: &str = "projects/chrome-swarming/instances/default_instance";

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Configuration for the bisection engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BisectConfig {
    /// Fleet server, e.g. `https://chrome-swarming.appspot.com`.
    pub swarming_url: String,
    pub swarming_pool: String,
    pub cas_instance: String,
    /// Bearer token sent to source control and the fleet.
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub poll_interval_secs: u64,
    /// Status-poll failures tolerated within one wait phase before giving up.
    pub max_poll_failures: u32,
    /// Total task submissions when the fleet reports no resource.
    pub max_schedule_attempts: u32,
    pub default_magnitude: f64,
    /// Runs per commit; defaults to the first scheduled iteration count.
    pub iterations: u32,
}

impl Default for BisectConfig {
    fn default() -> Self {
        BisectConfig {
            swarming_url: std::env::var("PERFBISECT_SWARMING_URL")
                .unwrap_or_else(|_| DEFAULT_SWARMING_URL.to_string()),
            swarming_pool: std::env::var("PERFBISECT_SWARMING_POOL")
                .unwrap_or_else(|_| DEFAULT_SWARMING_POOL.to_string()),
            cas_instance: std::env::var("PERFBISECT_CAS_INSTANCE")
                .unwrap_or_else(|_| DEFAULT_CAS_INSTANCE.to_string()),
            auth_token: std::env::var("PERFBISECT_AUTH_TOKEN").ok(),
            poll_interval_secs: env_or("PERFBISECT_POLL_INTERVAL_SECS", 15),
            max_poll_failures: env_or("PERFBISECT_MAX_POLL_FAILURES", 5),
            max_schedule_attempts: env_or("PERFBISECT_MAX_SCHEDULE_ATTEMPTS", 3),
            default_magnitude: env_or("PERFBISECT_DEFAULT_MAGNITUDE", 1.0),
            iterations: BENCHMARK_RUN_ITERATIONS[0],
        }
    }
}

impl BisectConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn with_swarming(mut self, url: &str, pool: &str) -> Self {
        self.swarming_url = url.to_string();
        self.swarming_pool = pool.to_string();
        self
    }

    pub fn with_auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_string());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs();
        self
    }

    pub fn with_max_poll_failures(mut self, n: u32) -> Self {
        self.max_poll_failures = n;
        self
    }

    pub fn with_max_schedule_attempts(mut self, n: u32) -> Self {
        self.max_schedule_attempts = n;
        self
    }

    pub fn with_iterations(mut self, n: u32) -> Self {
        self.iterations = n;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Reject budgets that would stall or never run.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("poll_interval_secs", self.poll_interval_secs == 0),
            ("max_poll_failures", self.max_poll_failures == 0),
            ("max_schedule_attempts", self.max_schedule_attempts == 0),
            ("iterations", self.iterations == 0),
        ];
        for (name, bad) in checks {
            if bad {
                return Err(BisectError::InvalidRequest(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if !self.default_magnitude.is_finite() || self.default_magnitude <= 0.0 {
            return Err(BisectError::InvalidRequest(format!(
                "default_magnitude must be positive, got {}",
                self.default_magnitude
            )));
        }
        Ok(())
    }
}
