//! In-stream ping loop for one stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::transport::frame::SubscribeRequest;

use super::state::SharedSink;
use super::Connection;

/// Write a ping every interval and arm a pong deadline for each.
///
/// The deadline watcher runs as its own one-shot task so a slow write
/// never delays the timeout accounting of earlier pings. The pending-pong
/// set is naturally bounded by `ceil(timeout / interval) + 1`: every armed
/// deadline removes its id when it fires.
pub(super) async fn ping_loop(
    conn: Arc<Connection>,
    sink: SharedSink,
    generation: u64,
    mut close_rx: watch::Receiver<bool>,
) {
    let interval = Duration::from_millis(conn.ping_cfg.interval_ms);
    let pong_timeout = Duration::from_millis(conn.ping_cfg.timeout_ms);

    loop {
        tokio::select! {
            biased;

            _ = close_rx.changed() => {
                debug!(endpoint = %conn.endpoint_id(), generation, "Ping loop cancelled");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let id = {
            let mut inner = conn.inner.lock();
            if inner.epoch != generation {
                return;
            }
            inner.next_ping_id += 1;
            let id = inner.next_ping_id;
            inner.pending_pongs.insert(id);
            id
        };

        trace!(endpoint = %conn.endpoint_id(), ping_id = id, "Sending ping");
        if sink.lock().await.send(SubscribeRequest::ping(id)).await.is_err() {
            // The write half is gone; the reader observes the stream error
            // and drives the failure path.
            debug!(endpoint = %conn.endpoint_id(), "Ping write failed, stopping ping loop");
            return;
        }

        let watcher = Arc::clone(&conn);
        tokio::spawn(async move {
            tokio::time::sleep(pong_timeout).await;
            watcher.note_pong_deadline(id, generation);
        });
    }
}
