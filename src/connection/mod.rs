//! Per-endpoint connection lifecycle.
//!
//! Each [`Connection`] owns one transport client and at most one open
//! bidirectional stream. It runs three independently-scheduled activities:
//! the inbound-frame reader, the in-stream ping loop, and the out-of-band
//! health-check loop. Every failure schedules a reconnect; reconnection is
//! unbounded, so a connection never gives up while the pool is running.
//!
//! The connection reports upward through two one-way channels (the public
//! event sink and the pool's lifecycle channel), and the pool calls back
//! only through methods on this type, so neither side holds a reference
//! cycle.

mod health;
mod ping;
mod reader;
mod state;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectBackoff;
use crate::breaker::CircuitBreaker;
use crate::config::{CircuitBreakerConfig, EndpointConfig, StreamPingConfig};
use crate::dedup::{DedupOutcome, SignatureCache};
use crate::error::{Error, Result};
use crate::event::{DisconnectReason, EndpointId, PoolEvent, Signature};
use crate::metrics::{ConnectionMetrics, ConnectionStatus, PoolCounters};
use crate::pool::{EventSink, LifecycleEvent};
use crate::transport::frame::{ServerFrame, SubscribeRequest};
use crate::transport::{TransportClient, TransportFactory};

use state::{ActiveStream, Inner, SharedSink, MAX_PROBE_FAILURES};

/// How a failure should be handled.
struct FailureOpts {
    /// Emit `ConnectionLost` and notify the pool. Forced reconnects skip
    /// this so the caller's own handling does not echo back as an event
    /// storm.
    emit_lost: bool,
    /// Tear down the transport client along with the stream.
    release_client: bool,
    /// Reconnect immediately instead of after backoff.
    immediate: bool,
    /// Proceed even when the connection is not currently `Connected`.
    force: bool,
}

/// One endpoint's connection, shared between its own background tasks and
/// the pool.
pub(crate) struct Connection {
    endpoint: EndpointConfig,
    id: EndpointId,
    index: usize,
    transport: TransportFactory,
    breaker: CircuitBreaker,
    ping_cfg: StreamPingConfig,
    backoff: ReconnectBackoff,
    events: EventSink,
    lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
    dedup: Arc<SignatureCache>,
    counters: Arc<PoolCounters>,
    client: tokio::sync::Mutex<Option<Box<dyn TransportClient>>>,
    inner: Mutex<Inner>,
    frames_received: AtomicU64,
    data_frames_received: AtomicU64,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        endpoint: EndpointConfig,
        index: usize,
        transport: TransportFactory,
        ping_cfg: StreamPingConfig,
        breaker_cfg: CircuitBreakerConfig,
        events: EventSink,
        lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
        dedup: Arc<SignatureCache>,
        counters: Arc<PoolCounters>,
    ) -> Arc<Self> {
        let id = EndpointId::new(endpoint.address.clone());
        let backoff = ReconnectBackoff::new(endpoint.reconnect_delay_ms);
        Arc::new(Self {
            endpoint,
            id,
            index,
            transport,
            breaker: CircuitBreaker::new(breaker_cfg),
            ping_cfg,
            backoff,
            events,
            lifecycle,
            dedup,
            counters,
            client: tokio::sync::Mutex::new(None),
            inner: Mutex::new(Inner::new()),
            frames_received: AtomicU64::new(0),
            data_frames_received: AtomicU64::new(0),
        })
    }

    pub(crate) fn endpoint_id(&self) -> &EndpointId {
        &self.id
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.inner.lock().status
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub(crate) fn has_active_stream(&self) -> bool {
        self.inner.lock().stream.is_some()
    }

    /// A connected endpoint is stale when no data frame arrived within
    /// `timeout`. Pongs do not count.
    pub(crate) fn is_stale(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock();
        inner.status == ConnectionStatus::Connected
            && inner
                .last_data_frame_at
                .is_some_and(|at| at.elapsed() > timeout)
    }

    pub(crate) fn last_data_at(&self) -> Option<Instant> {
        self.inner.lock().last_data_frame_at
    }

    pub(crate) fn metrics(&self) -> ConnectionMetrics {
        let inner = self.inner.lock();
        ConnectionMetrics {
            endpoint: self.id.clone(),
            status: inner.status,
            reconnect_attempts: inner.reconnect_attempts,
            consecutive_missed_pongs: inner.missed_pongs,
            consecutive_probe_failures: inner.probe_failures,
            frames_received: self.frames_received.load(Ordering::Relaxed),
            data_frames_received: self.data_frames_received.load(Ordering::Relaxed),
            last_data_age_ms: inner
                .last_data_frame_at
                .map(|at| at.elapsed().as_millis() as u64),
            last_frame_age_ms: inner
                .last_any_frame_at
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Begin connecting. Idempotent; a second call while started is a
    /// no-op.
    pub(crate) fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.started {
                return;
            }
            inner.started = true;
            inner.status = ConnectionStatus::Connecting;
        }
        info!(endpoint = %self.id, "Starting connection");

        if !self.endpoint.skip_ping {
            let handle = tokio::spawn(health::health_loop(Arc::clone(self)));
            self.inner.lock().health_task = Some(handle);
        }
        self.spawn_reconnect(Duration::ZERO);
    }

    /// Cancel timers and the current stream, release the transport client
    /// and move to `Disconnected`. The connection can be started again.
    pub(crate) async fn stop(&self) {
        let (stream, health_task, reconnect_task) = {
            let mut inner = self.inner.lock();
            inner.started = false;
            inner.status = ConnectionStatus::Disconnected;
            inner.pending_pongs.clear();
            inner.missed_pongs = 0;
            inner.probe_failures = 0;
            (
                inner.stream.take(),
                inner.health_task.take(),
                inner.reconnect_task.take(),
            )
        };
        if let Some(handle) = health_task {
            handle.abort();
        }
        if let Some(handle) = reconnect_task {
            handle.abort();
        }
        if let Some(stream) = stream {
            state::close_stream(stream, &self.id).await;
        }
        if let Some(mut client) = self.client.lock().await.take() {
            client.release().await;
        }
        debug!(endpoint = %self.id, "Connection stopped");
    }

    /// Open a fresh subscription stream, writing `request` as its first
    /// message. Any prior stream is closed first so at most one stream
    /// exists per endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] when the breaker refuses the
    /// attempt, [`Error::NotConnected`] when no transport client exists,
    /// or the transport's own error when the open fails.
    pub(crate) async fn open_subscription_stream(
        self: &Arc<Self>,
        request: SubscribeRequest,
    ) -> Result<()> {
        self.close_current_stream().await;

        let pair = self
            .breaker
            .execute(|| async {
                let mut guard = self.client.lock().await;
                let client = guard.as_mut().ok_or(Error::NotConnected)?;
                client.open_stream(request).await
            })
            .await?;

        let mut inner = self.inner.lock();
        if !inner.started || inner.status != ConnectionStatus::Connected {
            // Lost the race with a failure or stop; discard the fresh
            // stream without installing it.
            drop(inner);
            let mut pair = pair;
            pair.source.cancel();
            pair.sink.cancel();
            return Err(Error::NotConnected);
        }

        inner.epoch += 1;
        let generation = inner.epoch;
        inner.pending_pongs.clear();
        inner.missed_pongs = 0;

        let (close_tx, close_rx) = watch::channel(false);
        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(pair.sink));
        let reader_task = tokio::spawn(reader::read_loop(
            Arc::clone(self),
            pair.source,
            generation,
            close_rx.clone(),
        ));
        let ping_task = if self.ping_cfg.enabled && !self.endpoint.skip_ping {
            Some(tokio::spawn(ping::ping_loop(
                Arc::clone(self),
                Arc::clone(&sink),
                generation,
                close_rx,
            )))
        } else {
            None
        };

        if let Some(prev) = inner.stream.replace(ActiveStream {
            sink,
            close_tx,
            reader_task,
            ping_task,
            generation,
        }) {
            // Lost a race with a concurrent open; the older stream is
            // retired with the full closure discipline.
            let id = self.id.clone();
            tokio::spawn(async move {
                state::close_stream(prev, &id).await;
            });
        }
        debug!(endpoint = %self.id, generation, "Subscription stream opened");
        Ok(())
    }

    /// Close the current stream, if any, with the full closure discipline.
    pub(crate) async fn close_current_stream(&self) {
        let stream = {
            let mut inner = self.inner.lock();
            inner.pending_pongs.clear();
            inner.missed_pongs = 0;
            inner.stream.take()
        };
        if let Some(stream) = stream {
            state::close_stream(stream, &self.id).await;
        }
    }

    /// Tear down the transport client and stream, mark `Failed` and
    /// reconnect immediately, preserving the attempt counter.
    ///
    /// Does not emit `ConnectionLost`: the caller already accounted for
    /// the loss.
    pub(crate) fn force_reconnect(self: &Arc<Self>, reason: DisconnectReason) {
        debug!(endpoint = %self.id, reason = %reason, "Forcing reconnect");
        self.handle_failure(
            reason,
            None,
            FailureOpts {
                emit_lost: false,
                release_client: true,
                immediate: true,
                force: true,
            },
        );
    }

    /// Central failure path: transition to `Failed`, tear down, schedule
    /// reconnect. Emits `ConnectionLost` at most once per transition out
    /// of `Connected`.
    fn handle_failure(
        self: &Arc<Self>,
        reason: DisconnectReason,
        generation: Option<u64>,
        opts: FailureOpts,
    ) {
        let (was_connected, stream, delay) = {
            let mut inner = self.inner.lock();
            if !inner.started {
                return;
            }
            if let Some(generation) = generation {
                if inner.epoch != generation {
                    return;
                }
            }
            if !opts.force && inner.status != ConnectionStatus::Connected {
                return;
            }
            let was_connected = inner.status == ConnectionStatus::Connected;
            inner.status = ConnectionStatus::Failed;
            inner.pending_pongs.clear();
            inner.missed_pongs = 0;
            inner.probe_failures = 0;
            let delay = if opts.immediate {
                Duration::ZERO
            } else {
                self.backoff.delay_for_attempt(inner.reconnect_attempts)
            };
            (was_connected, inner.stream.take(), delay)
        };

        if was_connected && opts.emit_lost {
            warn!(endpoint = %self.id, reason = %reason, "Connection lost");
            self.events.emit(PoolEvent::ConnectionLost {
                endpoint: self.id.clone(),
                reason: reason.clone(),
                at: Utc::now(),
            });
            let _ = self.lifecycle.send(LifecycleEvent::Down {
                index: self.index,
                reason,
            });
        }

        // Teardown runs on the reconnect task so timer callbacks and the
        // reader never block on stream closure.
        let conn = Arc::clone(self);
        let release_client = opts.release_client;
        let handle = tokio::spawn(async move {
            if let Some(stream) = stream {
                state::close_stream(stream, &conn.id).await;
            }
            if release_client {
                if let Some(mut client) = conn.client.lock().await.take() {
                    client.release().await;
                }
            }
            run_reconnect(conn, delay).await;
        });
        let mut inner = self.inner.lock();
        if let Some(prev) = inner.reconnect_task.replace(handle) {
            prev.abort();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, delay: Duration) {
        let conn = Arc::clone(self);
        let handle = tokio::spawn(run_reconnect(conn, delay));
        let mut inner = self.inner.lock();
        if let Some(prev) = inner.reconnect_task.replace(handle) {
            prev.abort();
        }
    }

    /// One connect attempt through the breaker: construct the transport
    /// client if needed, then pass the initial liveness probe.
    ///
    /// Returns `true` when the reconnect loop should stop (connected, or
    /// the connection was stopped underneath us).
    async fn attempt_connect(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if !inner.started {
                return true;
            }
            inner.status = if inner.ever_connected {
                ConnectionStatus::Reconnecting
            } else {
                ConnectionStatus::Connecting
            };
        }

        let connect_timeout = Duration::from_millis(self.endpoint.connection_timeout_ms);
        let request_timeout = Duration::from_millis(self.endpoint.request_timeout_ms);

        let result = self
            .breaker
            .execute(|| async {
                let mut guard = self.client.lock().await;
                if guard.is_none() {
                    let client =
                        tokio::time::timeout(connect_timeout, self.transport.connect(&self.endpoint))
                            .await
                            .map_err(|_| Error::Timeout(connect_timeout))??;
                    *guard = Some(client);
                }
                if !self.endpoint.skip_ping {
                    if let Some(client) = guard.as_mut() {
                        tokio::time::timeout(request_timeout, client.probe_liveness())
                            .await
                            .map_err(|_| Error::Timeout(request_timeout))??;
                    }
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                let recovered = {
                    let mut inner = self.inner.lock();
                    if !inner.started {
                        return true;
                    }
                    let recovered = inner.ever_connected;
                    inner.status = ConnectionStatus::Connected;
                    inner.ever_connected = true;
                    inner.reconnect_attempts = 0;
                    inner.probe_failures = 0;
                    inner.missed_pongs = 0;
                    inner.pending_pongs.clear();
                    let now = Instant::now();
                    inner.last_any_frame_at = Some(now);
                    inner.last_data_frame_at = Some(now);
                    recovered
                };

                info!(endpoint = %self.id, recovered, "Connected");
                self.events.emit(PoolEvent::ConnectionEstablished {
                    endpoint: self.id.clone(),
                    at: Utc::now(),
                });
                if recovered {
                    self.events.emit(PoolEvent::ConnectionRecovered {
                        endpoint: self.id.clone(),
                        at: Utc::now(),
                    });
                }
                let _ = self.lifecycle.send(LifecycleEvent::Up {
                    index: self.index,
                    recovered,
                });
                true
            }
            Err(error) if error.is_circuit_open() => {
                // The breaker refused without attempting; keep the timer
                // cadence and try again later.
                self.inner.lock().status = ConnectionStatus::Failed;
                debug!(endpoint = %self.id, "Breaker open, deferring reconnect");
                false
            }
            Err(error) => {
                {
                    let mut inner = self.inner.lock();
                    inner.status = ConnectionStatus::Failed;
                    inner.reconnect_attempts = inner.reconnect_attempts.saturating_add(1);
                }
                warn!(endpoint = %self.id, error = %error, "Connect attempt failed");
                false
            }
        }
    }

    /// Classify one inbound frame.
    ///
    /// Pongs settle ping bookkeeping and are not delivered upward. Data
    /// frames advance both liveness clocks; frames with a signature go
    /// through dedup and out to the merged stream.
    pub(super) fn handle_frame(&self, frame: ServerFrame, generation: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        if let Some(id) = frame.pong_id() {
            let mut inner = self.inner.lock();
            if inner.epoch != generation {
                return;
            }
            inner.last_any_frame_at = Some(now);
            if inner.pending_pongs.remove(&id) {
                inner.missed_pongs = 0;
            }
            return;
        }

        {
            let mut inner = self.inner.lock();
            if inner.epoch != generation {
                return;
            }
            inner.last_any_frame_at = Some(now);
            inner.last_data_frame_at = Some(now);
        }
        self.data_frames_received.fetch_add(1, Ordering::Relaxed);

        if let Err(error) = self.process_data_frame(frame) {
            self.counters
                .message_processing_errors
                .fetch_add(1, Ordering::Relaxed);
            warn!(endpoint = %self.id, error = %error, "Dropping malformed frame");
        }
    }

    fn process_data_frame(&self, frame: ServerFrame) -> Result<()> {
        let Some(signature) = frame.signature() else {
            // No dedup key; the frame already counted toward liveness.
            return Ok(());
        };
        let signature = Signature::from(signature);
        let update = frame
            .transaction_update()
            .cloned()
            .ok_or_else(|| Error::Stream("data frame missing transaction body".to_string()))?;

        match self.dedup.check_and_insert(signature.as_bytes(), &self.id) {
            DedupOutcome::FirstSeen => {
                self.counters
                    .transactions_delivered
                    .fetch_add(1, Ordering::Relaxed);
                self.events.emit(PoolEvent::TransactionDelivered {
                    message: update,
                    signature,
                    source: self.id.clone(),
                    at: Utc::now(),
                });
            }
            DedupOutcome::Duplicate { original_source } => {
                self.counters
                    .duplicates_filtered
                    .fetch_add(1, Ordering::Relaxed);
                self.events.emit(PoolEvent::DuplicateFiltered {
                    signature,
                    source: self.id.clone(),
                    original_source,
                    at: Utc::now(),
                });
            }
        }
        Ok(())
    }

    /// Reader-observed stream error. Cancellation-class errors after a
    /// local close are normal termination.
    pub(super) fn handle_stream_error(self: &Arc<Self>, error: Error, generation: u64) {
        if error.is_cancellation() {
            debug!(endpoint = %self.id, "Stream cancelled locally");
            return;
        }
        self.handle_failure(
            DisconnectReason::StreamError(error.to_string()),
            Some(generation),
            FailureOpts {
                emit_lost: true,
                release_client: false,
                immediate: false,
                force: false,
            },
        );
    }

    /// A ping's pong deadline fired.
    pub(super) fn note_pong_deadline(self: &Arc<Self>, id: u64, generation: u64) {
        let fail = {
            let mut inner = self.inner.lock();
            if inner.epoch != generation {
                return;
            }
            if !inner.pending_pongs.remove(&id) {
                return;
            }
            inner.missed_pongs += 1;
            debug!(
                endpoint = %self.id,
                ping_id = id,
                missed = inner.missed_pongs,
                "Pong deadline expired"
            );
            inner.missed_pongs >= self.ping_cfg.max_missed_pongs
        };
        if fail {
            self.handle_failure(
                DisconnectReason::PingTimeout,
                Some(generation),
                FailureOpts {
                    emit_lost: true,
                    release_client: false,
                    immediate: false,
                    force: false,
                },
            );
        }
    }

    /// Outcome of one out-of-band liveness probe.
    pub(super) fn note_probe_result(self: &Arc<Self>, result: Result<()>) {
        match result {
            Ok(()) => {
                self.inner.lock().probe_failures = 0;
            }
            Err(error) => {
                let fail = {
                    let mut inner = self.inner.lock();
                    if inner.status != ConnectionStatus::Connected {
                        return;
                    }
                    inner.probe_failures += 1;
                    inner.probe_failures >= MAX_PROBE_FAILURES
                };
                warn!(endpoint = %self.id, error = %error, "Liveness probe failed");
                if fail {
                    self.handle_failure(
                        DisconnectReason::HealthCheckFailed,
                        None,
                        FailureOpts {
                            emit_lost: true,
                            release_client: true,
                            immediate: false,
                            force: false,
                        },
                    );
                }
            }
        }
    }
}

/// Reconnect loop: wait, attempt, repeat with exponential backoff until
/// connected or stopped.
async fn run_reconnect(conn: Arc<Connection>, mut delay: Duration) {
    loop {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if conn.attempt_connect().await {
            return;
        }
        let attempts = conn.inner.lock().reconnect_attempts;
        delay = conn.backoff.delay_for_attempt(attempts);
    }
}
