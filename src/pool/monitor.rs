//! Message-timeout sweep and periodic health reporting.
//!
//! A server can answer every ping while delivering no data; only data
//! frames reset the staleness clock, so such endpoints are detected here
//! and forced through a reconnect.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::event::{DisconnectReason, PoolEvent};

use super::{fanout, PoolShared};

/// Periodic sweep over every connection. Emits a health snapshot each
/// tick; when a message timeout is configured, stale connections are
/// reported lost and forced to reconnect.
pub(super) async fn monitor_loop(shared: Arc<PoolShared>) {
    let interval = Duration::from_millis(shared.config.sweep_interval_ms);
    let message_timeout = Duration::from_millis(shared.config.message_timeout_ms);

    loop {
        tokio::time::sleep(interval).await;

        let metrics: Vec<_> = shared.connections.iter().map(|conn| conn.metrics()).collect();
        shared.events.emit(PoolEvent::HealthCheck {
            metrics,
            at: Utc::now(),
        });

        if shared.config.message_timeout_ms == 0 {
            continue;
        }

        for conn in &shared.connections {
            if !conn.is_stale(message_timeout) {
                continue;
            }
            let last_data_age_ms = conn
                .last_data_at()
                .map(|at| at.elapsed().as_millis() as u64);
            warn!(
                endpoint = %conn.endpoint_id(),
                timeout_ms = shared.config.message_timeout_ms,
                last_data_age_ms = ?last_data_age_ms,
                "No data within message timeout, forcing reconnect"
            );
            shared.events.emit(PoolEvent::ConnectionLost {
                endpoint: conn.endpoint_id().clone(),
                reason: DisconnectReason::MessageTimeout,
                at: Utc::now(),
            });
            fanout::emit_failover(&shared, conn.index(), DisconnectReason::MessageTimeout);
            // The forced reconnect closes the stream before a new one is
            // opened and deliberately emits no second ConnectionLost.
            conn.force_reconnect(DisconnectReason::MessageTimeout);
        }
    }
}
