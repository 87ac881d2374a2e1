//! Circuit breaker configuration.

use serde::Deserialize;

/// Settings for the per-endpoint circuit breaker that gates stream
/// acquisition attempts.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure ratio (percent of total attempts) at which the breaker
    /// opens.
    #[serde(default = "default_error_threshold_pct")]
    pub error_threshold_pct: u32,

    /// Minimum attempts recorded before the ratio is consulted at all.
    /// The gate is strict: below this count the breaker never opens.
    #[serde(default = "default_min_request_threshold")]
    pub min_request_threshold: u64,

    /// How long an open breaker refuses attempts before letting a probe
    /// through (milliseconds).
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Wall-clock deadline applied to each gated operation (milliseconds).
    /// A timeout counts as a failure.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

const fn default_error_threshold_pct() -> u32 {
    50
}

const fn default_min_request_threshold() -> u64 {
    5
}

const fn default_reset_timeout_ms() -> u64 {
    30_000
}

const fn default_op_timeout_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_pct: default_error_threshold_pct(),
            min_request_threshold: default_min_request_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub(crate) fn collect_problems(&self, problems: &mut Vec<String>) {
        if self.error_threshold_pct > 100 {
            problems.push("circuit_breaker.error_threshold_pct: must be 0-100".to_string());
        }
        if self.min_request_threshold == 0 {
            problems.push("circuit_breaker.min_request_threshold: must be >= 1".to_string());
        }
        if self.reset_timeout_ms < 1_000 {
            problems.push("circuit_breaker.reset_timeout_ms: must be >= 1000".to_string());
        }
        if self.op_timeout_ms == 0 {
            problems.push("circuit_breaker.op_timeout_ms: must be >= 1".to_string());
        }
    }
}
