//! Cross-source deduplication configuration.

use serde::Deserialize;

/// Settings for the signature cache that filters duplicate events arriving
/// over redundant connections.
#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Retention horizon: a signature seen within this window is a
    /// duplicate (milliseconds).
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Hard cap on cache entries.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

const fn default_window_ms() -> u64 {
    30_000
}

const fn default_max_entries() -> usize {
    100_000
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_entries: default_max_entries(),
        }
    }
}

impl DedupConfig {
    pub(crate) fn collect_problems(&self, problems: &mut Vec<String>) {
        if self.window_ms < 1_000 {
            problems.push("dedup.window_ms: must be >= 1000".to_string());
        }
        if self.max_entries < 100 {
            problems.push("dedup.max_entries: must be >= 100".to_string());
        }
    }
}
