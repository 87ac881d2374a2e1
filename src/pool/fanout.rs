//! Subscription fan-out and replay.
//!
//! The supervisor task consumes connection lifecycle notifications and
//! keeps the active subscription present on every connected endpoint:
//! replay on reconnect, gentler stream-start retries when an open fails on
//! a healthy connection, and failover events when an endpoint drops while
//! others remain up.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::StreamRetryBackoff;
use crate::event::{DisconnectReason, PoolEvent};

use super::{LifecycleEvent, PoolShared};

#[derive(Default)]
struct RetryState {
    backoff: StreamRetryBackoff,
    timer: Option<JoinHandle<()>>,
}

impl RetryState {
    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Supervisor loop. Exits on the pool's shutdown signal, aborting every
/// pending retry timer on the way out.
pub(super) async fn supervise(shared: Arc<PoolShared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut retries: Vec<RetryState> = (0..shared.connections.len())
        .map(|_| RetryState::default())
        .collect();

    // Held for the supervisor's lifetime; released on exit so a restarted
    // pool can supervise again.
    let mut lifecycle_rx = shared.lifecycle_rx.lock().await;

    loop {
        let step = tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                None
            }
            message = lifecycle_rx.recv() => Some(message),
        };

        match step {
            None => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            Some(Some(message)) => handle_message(&shared, &mut retries, message).await,
            Some(None) => break,
        }
    }

    for retry in &mut retries {
        retry.clear_timer();
    }
    debug!("Supervisor stopped");
}

async fn handle_message(
    shared: &Arc<PoolShared>,
    retries: &mut [RetryState],
    message: LifecycleEvent,
) {
    match message {
        LifecycleEvent::Up { index, .. } => {
            retries[index].clear_timer();
            retries[index].backoff.reset();
            replay_subscription(shared, retries, index).await;
        }
        LifecycleEvent::Down { index, reason } => {
            retries[index].clear_timer();
            emit_failover(shared, index, reason);
        }
        LifecycleEvent::StreamOpenFailed { index, reset } => {
            schedule_retry(shared, retries, index, reset);
        }
        LifecycleEvent::StreamRetry { index } => {
            replay_subscription(shared, retries, index).await;
        }
    }
}

/// Write the stored subscription onto a fresh stream for `index`.
///
/// A no-op when nothing is subscribed or the connection went down again
/// in the meantime (its next `Up` replays).
async fn replay_subscription(shared: &Arc<PoolShared>, retries: &mut [RetryState], index: usize) {
    let request = shared.subscription.read().clone();
    let Some(request) = request else {
        return;
    };

    let conn = &shared.connections[index];
    if !conn.is_healthy() || conn.has_active_stream() {
        // Down, or the subscription already reached this endpoint through
        // the direct subscribe path.
        return;
    }

    match conn.open_subscription_stream(request).await {
        Ok(()) => {
            retries[index].backoff.reset();
            debug!(endpoint = %conn.endpoint_id(), "Subscription replayed");
        }
        Err(error) if error.is_circuit_open() => {
            // Refused without attempting; keep retrying on the schedule.
            schedule_retry(shared, retries, index, false);
        }
        Err(error) => {
            warn!(endpoint = %conn.endpoint_id(), error = %error, "Stream open failed");
            shared.events.emit(PoolEvent::Error {
                error: error.to_string(),
                context: "stream-start",
                at: Utc::now(),
            });
            let reset = error.is_reset();
            schedule_retry(shared, retries, index, reset);
        }
    }
}

/// Arm the stream-start retry timer for `index`, replacing any pending
/// one.
fn schedule_retry(shared: &Arc<PoolShared>, retries: &mut [RetryState], index: usize, reset: bool) {
    let delay = retries[index].backoff.next_delay(reset);
    retries[index].clear_timer();

    let tx = shared.lifecycle_tx.clone();
    retries[index].timer = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(LifecycleEvent::StreamRetry { index });
    }));

    debug!(
        endpoint = %shared.connections[index].endpoint_id(),
        delay_ms = delay.as_millis() as u64,
        reset,
        "Stream start retry scheduled"
    );
}

/// Emit a failover event when a connection is lost while at least one
/// other endpoint is still healthy. The target is the first healthy
/// endpoint in declaration order.
pub(super) fn emit_failover(shared: &Arc<PoolShared>, from_index: usize, reason: DisconnectReason) {
    let Some(target) = shared
        .connections
        .iter()
        .find(|conn| conn.index() != from_index && conn.is_healthy())
    else {
        return;
    };
    shared.events.emit(PoolEvent::Failover {
        from: shared.connections[from_index].endpoint_id().clone(),
        to: target.endpoint_id().clone(),
        reason,
        at: Utc::now(),
    });
}
