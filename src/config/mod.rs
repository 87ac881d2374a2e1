//! Pool, endpoint and liveness configuration.
//!
//! All options deserialize with serde and carry defaults, so a consumer can
//! construct a [`PoolConfig`] from any configuration source (or literally,
//! in tests). Validation happens once, at pool construction, and reports
//! every violation in a single error message.

use serde::Deserialize;

mod breaker;
mod dedup;
mod endpoint;
mod ping;

pub use breaker::CircuitBreakerConfig;
pub use dedup::DedupConfig;
pub use endpoint::EndpointConfig;
pub use ping::StreamPingConfig;

use crate::error::{Error, Result};

/// Top-level configuration for a subscription pool.
///
/// Every endpoint listed here receives the full active subscription; the
/// pool exists for redundancy, not for load distribution.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Upstream endpoints, in priority order.
    ///
    /// Declaration order is meaningful: failover events name the first
    /// healthy endpoint in this order as the takeover target.
    pub endpoints: Vec<EndpointConfig>,

    /// Mark a connected endpoint stale after this long without a data
    /// frame (milliseconds). `0` disables the staleness sweep entirely.
    ///
    /// Pong frames do not count: an endpoint answering pings while
    /// delivering no data is still stale.
    #[serde(default)]
    pub message_timeout_ms: u64,

    /// Cadence of the staleness sweep (milliseconds).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Merged event channel capacity (bounded to prevent unbounded memory
    /// growth under backpressure).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// When `true`, `subscribe` with zero healthy endpoints still records
    /// the request (so endpoints that recover later pick it up) before
    /// returning the error. Default is to reject without recording.
    #[serde(default)]
    pub record_subscription_without_endpoints: bool,

    /// Cross-source deduplication settings.
    #[serde(default)]
    pub dedup: DedupConfig,

    /// In-stream ping/pong keep-alive settings.
    #[serde(default)]
    pub stream_ping: StreamPingConfig,

    /// Per-endpoint circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

const fn default_sweep_interval_ms() -> u64 {
    30_000
}

const fn default_channel_capacity() -> usize {
    10_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            message_timeout_ms: 0,
            sweep_interval_ms: default_sweep_interval_ms(),
            channel_capacity: default_channel_capacity(),
            record_subscription_without_endpoints: false,
            dedup: DedupConfig::default(),
            stream_ping: StreamPingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Convenience constructor for a pool over the given endpoints with
    /// default tuning.
    #[must_use]
    pub fn with_endpoints(endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            endpoints,
            ..Self::default()
        }
    }

    /// Validate every option, collecting all violations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every invalid field, so operators
    /// can fix a bad deployment in one pass rather than one error at a time.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.endpoints.is_empty() {
            problems.push("endpoints: at least one endpoint is required".to_string());
        }
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            endpoint.collect_problems(i, &mut problems);
        }

        if self.message_timeout_ms != 0 && self.message_timeout_ms < 1_000 {
            problems.push("message_timeout_ms: must be 0 (disabled) or >= 1000".to_string());
        }
        if self.sweep_interval_ms == 0 {
            problems.push("sweep_interval_ms: must be > 0".to_string());
        }
        if self.channel_capacity == 0 {
            problems.push("channel_capacity: must be > 0".to_string());
        }

        self.dedup.collect_problems(&mut problems);
        self.stream_ping.collect_problems(&mut problems);
        self.circuit_breaker.collect_problems(&mut problems);

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}
