//! Per-endpoint connection configuration.

use std::collections::HashMap;

use serde::Deserialize;

/// One upstream server contributing to the pool.
///
/// Immutable after construction. The address and credential identify the
/// server; the remaining knobs tune this endpoint's connection lifecycle
/// independently of its peers.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// gRPC endpoint URI, e.g. `https://grpc.example.com:443`.
    pub address: String,

    /// Access token sent as `x-token` metadata. Empty for anonymous
    /// endpoints.
    #[serde(default)]
    pub x_token: String,

    /// Disable both the in-stream ping loop and the out-of-band health
    /// probe for this endpoint. For servers that reject or misbehave on
    /// keep-alive traffic.
    #[serde(default)]
    pub skip_ping: bool,

    /// Base delay for the exponential reconnect backoff (milliseconds).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Period of the out-of-band liveness probe (milliseconds).
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Deadline for establishing the transport connection (milliseconds).
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Deadline for a single liveness probe (milliseconds).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Opaque transport options passed through to the transport layer.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

const fn default_reconnect_delay_ms() -> u64 {
    1_000
}

const fn default_health_check_interval_ms() -> u64 {
    30_000
}

const fn default_connection_timeout_ms() -> u64 {
    10_000
}

const fn default_request_timeout_ms() -> u64 {
    10_000
}

impl EndpointConfig {
    /// An anonymous endpoint at `address` with default tuning.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            x_token: String::new(),
            skip_ping: false,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            options: HashMap::new(),
        }
    }

    /// Same endpoint with an access token attached.
    #[must_use]
    pub fn with_token(mut self, x_token: impl Into<String>) -> Self {
        self.x_token = x_token.into();
        self
    }

    pub(crate) fn collect_problems(&self, index: usize, problems: &mut Vec<String>) {
        let field = |name: &str| format!("endpoints[{index}].{name}");

        if self.address.trim().is_empty() {
            problems.push(format!("{}: must not be empty", field("address")));
        }
        if self.reconnect_delay_ms < 1_000 {
            problems.push(format!("{}: must be >= 1000", field("reconnect_delay_ms")));
        }
        if self.health_check_interval_ms < 1_000 {
            problems.push(format!(
                "{}: must be >= 1000",
                field("health_check_interval_ms")
            ));
        }
        if self.connection_timeout_ms < 1_000 {
            problems.push(format!(
                "{}: must be >= 1000",
                field("connection_timeout_ms")
            ));
        }
        if self.request_timeout_ms < 1_000 {
            problems.push(format!("{}: must be >= 1000", field("request_timeout_ms")));
        }
        if self.request_timeout_ms >= self.health_check_interval_ms {
            problems.push(format!(
                "{}: must be < health_check_interval_ms",
                field("request_timeout_ms")
            ));
        }
    }
}
