//! Canonical test configurations.
//!
//! Single source of truth for config structs used across tests.
//! Avoids each test module defining its own slightly-different defaults.
//!
//! All timings sit at the validation minimums; tests run on the paused
//! tokio clock, so real seconds never elapse.

use crate::config::{
    CircuitBreakerConfig, DedupConfig, EndpointConfig, PoolConfig, StreamPingConfig,
};

/// Endpoint config with the fastest timings validation allows.
pub fn endpoint(address: &str) -> EndpointConfig {
    EndpointConfig {
        reconnect_delay_ms: 1_000,
        health_check_interval_ms: 5_000,
        connection_timeout_ms: 1_000,
        request_timeout_ms: 1_000,
        ..EndpointConfig::new(address)
    }
}

/// Pool config over the given endpoint addresses.
///
/// Pings default off so most tests see no keep-alive traffic; tests that
/// exercise the ping loop override `stream_ping`.
pub fn pool(addresses: &[&str]) -> PoolConfig {
    PoolConfig {
        endpoints: addresses.iter().map(|address| endpoint(address)).collect(),
        message_timeout_ms: 0,
        sweep_interval_ms: 30_000,
        channel_capacity: 1_024,
        record_subscription_without_endpoints: false,
        dedup: dedup(30_000),
        stream_ping: ping_disabled(),
        circuit_breaker: breaker(),
    }
}

/// Dedup config with the given window.
pub fn dedup(window_ms: u64) -> DedupConfig {
    DedupConfig {
        window_ms,
        max_entries: 1_000,
    }
}

/// Ping config that never sends pings.
pub fn ping_disabled() -> StreamPingConfig {
    StreamPingConfig {
        enabled: false,
        ..StreamPingConfig::default()
    }
}

/// Ping config with the given cadence.
pub fn ping(interval_ms: u64, timeout_ms: u64, max_missed_pongs: u32) -> StreamPingConfig {
    StreamPingConfig {
        enabled: true,
        interval_ms,
        timeout_ms,
        max_missed_pongs,
    }
}

/// Permissive breaker that does not interfere with connection tests.
pub fn breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        error_threshold_pct: 100,
        min_request_threshold: 1_000,
        reset_timeout_ms: 1_000,
        op_timeout_ms: 5_000,
    }
}
