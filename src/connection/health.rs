//! Out-of-band liveness probing, distinct from in-stream pings.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

use super::Connection;

/// Probe the transport client on a fixed interval while the connection is
/// up. A silent stream can hide a dead endpoint; the probe goes around the
/// stream entirely.
pub(super) async fn health_loop(conn: Arc<Connection>) {
    let interval = Duration::from_millis(conn.endpoint.health_check_interval_ms);
    let request_timeout = Duration::from_millis(conn.endpoint.request_timeout_ms);

    loop {
        tokio::time::sleep(interval).await;

        if !conn.is_healthy() {
            continue;
        }

        let result = {
            let mut guard = conn.client.lock().await;
            match guard.as_mut() {
                Some(client) => tokio::time::timeout(request_timeout, client.probe_liveness())
                    .await
                    .unwrap_or(Err(Error::Timeout(request_timeout))),
                None => continue,
            }
        };

        conn.note_probe_result(result);
    }
}
