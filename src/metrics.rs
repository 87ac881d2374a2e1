//! Observability counters and snapshots.
//!
//! Counters are updated atomically by connection and pool tasks; snapshots
//! are cheap, lock-free reads suitable for health endpoints.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::event::EndpointId;

/// Shared counters updated atomically across all pool tasks.
pub(crate) struct PoolCounters {
    /// Unique events delivered on the merged stream.
    pub(crate) transactions_delivered: AtomicU64,
    /// Duplicate events filtered by the signature cache.
    pub(crate) duplicates_filtered: AtomicU64,
    /// Events dropped because the merged channel was full.
    pub(crate) events_dropped: AtomicU64,
    /// Inbound frames that failed per-message processing and were dropped.
    pub(crate) message_processing_errors: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn new() -> Self {
        Self {
            transactions_delivered: AtomicU64::new(0),
            duplicates_filtered: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            message_processing_errors: AtomicU64::new(0),
        }
    }
}

/// Connection lifecycle state, as visible to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Point-in-time metrics for one endpoint's connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    /// Endpoint these metrics describe.
    pub endpoint: EndpointId,
    /// Current lifecycle state.
    pub status: ConnectionStatus,
    /// Reconnect attempts since the last successful connection.
    pub reconnect_attempts: u32,
    /// Consecutive unanswered in-stream pings.
    pub consecutive_missed_pongs: u32,
    /// Consecutive failed out-of-band liveness probes.
    pub consecutive_probe_failures: u32,
    /// Total frames received over this connection's lifetime.
    pub frames_received: u64,
    /// Data frames received over this connection's lifetime.
    pub data_frames_received: u64,
    /// Milliseconds since the last data frame, if any arrived yet.
    pub last_data_age_ms: Option<u64>,
    /// Milliseconds since the last frame of any kind, pongs included.
    ///
    /// Diverging from `last_data_age_ms` indicates an endpoint that is
    /// answering keep-alives without delivering data.
    pub last_frame_age_ms: Option<u64>,
}

impl ConnectionMetrics {
    /// A connection is healthy when it is in the `Connected` state.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Aggregate health report for the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    /// Whether the pool is between `start` and `stop`.
    pub running: bool,
    /// Endpoints currently in the `Connected` state.
    pub healthy_endpoints: usize,
    /// Total configured endpoints.
    pub total_endpoints: usize,
    /// Per-endpoint detail.
    pub connections: Vec<ConnectionMetrics>,
}

/// Runtime statistics for the pool's data path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Unique events delivered on the merged stream.
    pub transactions_delivered: u64,
    /// Duplicate events filtered by the signature cache.
    pub duplicates_filtered: u64,
    /// Events dropped because the merged channel was full.
    pub events_dropped: u64,
    /// Inbound frames dropped by per-message error handling.
    pub message_processing_errors: u64,
    /// Current signature cache occupancy.
    pub dedup_cache_size: usize,
}

impl PoolCounters {
    pub(crate) fn snapshot(&self, dedup_cache_size: usize) -> PoolStats {
        PoolStats {
            transactions_delivered: self.transactions_delivered.load(Ordering::Relaxed),
            duplicates_filtered: self.duplicates_filtered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            message_processing_errors: self.message_processing_errors.load(Ordering::Relaxed),
            dedup_cache_size,
        }
    }
}
