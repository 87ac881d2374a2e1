//! In-stream ping/pong keep-alive configuration.

use serde::Deserialize;

/// Settings for the per-stream ping loop.
///
/// Each ping carries a fresh id; the server must echo it back in a pong.
/// Unanswered pings accumulate, and crossing `max_missed_pongs` fails the
/// stream so the connection reconnects.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamPingConfig {
    /// Master switch for the ping loop on every stream.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Period between pings (milliseconds).
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// How long to wait for a single pong (milliseconds). Must be shorter
    /// than the interval.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive unanswered pings tolerated before the stream is failed.
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,
}

const fn default_enabled() -> bool {
    true
}

const fn default_interval_ms() -> u64 {
    30_000
}

const fn default_timeout_ms() -> u64 {
    10_000
}

const fn default_max_missed_pongs() -> u32 {
    3
}

impl Default for StreamPingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            max_missed_pongs: default_max_missed_pongs(),
        }
    }
}

impl StreamPingConfig {
    pub(crate) fn collect_problems(&self, problems: &mut Vec<String>) {
        if self.interval_ms < 1_000 {
            problems.push("stream_ping.interval_ms: must be >= 1000".to_string());
        }
        if self.timeout_ms < 1_000 {
            problems.push("stream_ping.timeout_ms: must be >= 1000".to_string());
        }
        if self.timeout_ms >= self.interval_ms {
            problems.push("stream_ping.timeout_ms: must be < interval_ms".to_string());
        }
        if self.max_missed_pongs == 0 {
            problems.push("stream_ping.max_missed_pongs: must be >= 1".to_string());
        }
    }
}
