//! The subscription pool: owns every connection, the signature cache and
//! the active subscription, and merges per-connection events into one
//! public stream.
//!
//! # Architecture
//!
//! Each connection runs its own reader/ping/health tasks and pushes
//! events into a shared bounded `mpsc` channel; the pool merges them via
//! [`next_event`](SubscriptionPool::next_event). A supervisor task reacts
//! to connection lifecycle transitions (replaying the active subscription
//! on every reconnect), and a monitor task sweeps for endpoints that went
//! silent while still answering pings.

mod fanout;
mod monitor;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::dedup::SignatureCache;
use crate::error::{Error, Result};
use crate::event::{DisconnectReason, PoolEvent};
use crate::metrics::{PoolCounters, PoolHealth, PoolStats};
use crate::transport::frame::SubscribeRequest;
use crate::transport::TransportFactory;

/// Deadline for closing every stream during `stop`.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(8);

/// Grace period for the supervisor to exit on its own before being
/// aborted.
const SUPERVISOR_EXIT_GRACE: Duration = Duration::from_secs(1);

/// Internal notifications from connections to the pool supervisor.
#[derive(Debug)]
pub(crate) enum LifecycleEvent {
    /// An endpoint reached `Connected`.
    Up { index: usize, recovered: bool },
    /// An endpoint left `Connected`.
    Down {
        index: usize,
        reason: DisconnectReason,
    },
    /// A stream open failed on a healthy connection; schedule a retry.
    StreamOpenFailed { index: usize, reset: bool },
    /// A scheduled stream-start retry timer fired.
    StreamRetry { index: usize },
}

/// Emitter for the merged public event stream.
///
/// Non-blocking: when the channel is full the event is counted and
/// dropped rather than stalling a reader task.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<PoolEvent>,
    counters: Arc<PoolCounters>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<PoolEvent>, counters: Arc<PoolCounters>) -> Self {
        Self { tx, counters }
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event channel closed");
            }
        }
    }
}

struct PoolTasks {
    supervisor: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

/// State shared between the pool handle, its connections and the
/// process-wide shutdown coordinator.
pub(crate) struct PoolShared {
    config: PoolConfig,
    connections: Vec<Arc<Connection>>,
    dedup: Arc<SignatureCache>,
    counters: Arc<PoolCounters>,
    events: EventSink,
    subscription: RwLock<Option<SubscribeRequest>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
    lifecycle_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<LifecycleEvent>>>,
    tasks: Mutex<PoolTasks>,
}

impl PoolShared {
    /// Idempotent teardown shared by `stop` and the shutdown coordinator.
    pub(crate) async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);

        // The monitor only emits; kill it before the stop barrier.
        if let Some(handle) = self.tasks.lock().monitor.take() {
            handle.abort();
        }

        let closures = join_all(self.connections.iter().map(|conn| conn.stop()));
        if tokio::time::timeout(SHUTDOWN_DEADLINE, closures)
            .await
            .is_err()
        {
            warn!("Shutdown deadline reached with streams still closing");
        }

        let supervisor = self.tasks.lock().supervisor.take();
        if let Some(mut handle) = supervisor {
            if tokio::time::timeout(SUPERVISOR_EXIT_GRACE, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        *self.subscription.write() = None;
        self.dedup.stop();
        self.dedup.clear();
        info!("Pool stopped");
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn health_status(&self) -> PoolHealth {
        let connections: Vec<_> = self.connections.iter().map(|conn| conn.metrics()).collect();
        PoolHealth {
            running: self.is_running(),
            healthy_endpoints: connections.iter().filter(|m| m.is_healthy()).count(),
            total_endpoints: connections.len(),
            connections,
        }
    }
}

/// Active-active subscription pool over redundant upstream endpoints.
///
/// One logical subscription is fanned out to every healthy endpoint; the
/// inbound streams are merged, deduplicated by signature, and exposed as
/// a single event stream.
///
/// # Lifecycle
///
/// 1. [`new`](Self::new) validates configuration and builds connections
/// 2. [`start`](Self::start) brings every endpoint up concurrently
/// 3. [`subscribe`](Self::subscribe) places the active subscription
/// 4. [`next_event`](Self::next_event) in a loop to consume the merged
///    stream
/// 5. [`stop`](Self::stop) cancels everything deterministically
pub struct SubscriptionPool {
    shared: Arc<PoolShared>,
    event_rx: mpsc::Receiver<PoolEvent>,
}

impl SubscriptionPool {
    /// Build a pool over `config` using `transport` to reach endpoints.
    ///
    /// No connection is opened until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every invalid option.
    pub fn new(config: PoolConfig, transport: TransportFactory) -> Result<Self> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        let counters = Arc::new(PoolCounters::new());
        let events = EventSink::new(event_tx, Arc::clone(&counters));
        let dedup = SignatureCache::new(&config.dedup);
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let connections: Vec<_> = config
            .endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                Connection::new(
                    endpoint.clone(),
                    index,
                    Arc::clone(&transport),
                    config.stream_ping.clone(),
                    config.circuit_breaker.clone(),
                    events.clone(),
                    lifecycle_tx.clone(),
                    Arc::clone(&dedup),
                    Arc::clone(&counters),
                )
            })
            .collect();

        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                connections,
                dedup,
                counters,
                events,
                subscription: RwLock::new(None),
                running: AtomicBool::new(false),
                shutdown_tx,
                lifecycle_tx,
                lifecycle_rx: Arc::new(tokio::sync::Mutex::new(lifecycle_rx)),
                tasks: Mutex::new(PoolTasks {
                    supervisor: None,
                    monitor: None,
                }),
            }),
            event_rx,
        })
    }

    /// Start every connection concurrently and begin the background
    /// sweeps. Idempotent.
    ///
    /// The first started pool in the process installs the process-signal
    /// handlers via the shutdown coordinator.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` is part of the stable API.
    pub async fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shared.shutdown_tx.send(false);
        crate::shutdown::coordinator().register(&self.shared);
        self.shared.dedup.start_sweeper();

        {
            let mut tasks = self.shared.tasks.lock();
            tasks.supervisor = Some(tokio::spawn(fanout::supervise(Arc::clone(&self.shared))));
            tasks.monitor = Some(tokio::spawn(monitor::monitor_loop(Arc::clone(&self.shared))));
        }

        for conn in &self.shared.connections {
            conn.start();
        }

        info!(endpoints = self.shared.connections.len(), "Pool started");
        Ok(())
    }

    /// Stop the pool: cancel retry timers, close every stream in parallel
    /// under the shutdown deadline, stop all loops and clear state.
    ///
    /// Idempotent. After this returns no further events are emitted.
    pub async fn stop(&self) {
        self.shared.shutdown().await;
    }

    /// Place `request` as the active subscription on every healthy
    /// endpoint, replacing any prior subscription.
    ///
    /// Endpoints that are currently down pick the request up when they
    /// reconnect; endpoints whose stream open fails are retried on the
    /// stream-start schedule.
    ///
    /// # Errors
    ///
    /// [`Error::NotRunning`] before `start`,
    /// [`Error::InvalidSubscription`] for requests that cannot be an
    /// initial subscription, and [`Error::NoHealthyEndpoints`] when no
    /// endpoint is connected (the request is not recorded unless
    /// `record_subscription_without_endpoints` is set).
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<()> {
        if !self.shared.is_running() {
            return Err(Error::NotRunning);
        }
        request.validate_for_subscribe()?;

        let healthy: Vec<_> = self
            .shared
            .connections
            .iter()
            .filter(|conn| conn.is_healthy())
            .cloned()
            .collect();

        if healthy.is_empty() {
            if self.shared.config.record_subscription_without_endpoints {
                *self.shared.subscription.write() = Some(request);
            }
            return Err(Error::NoHealthyEndpoints);
        }

        *self.shared.subscription.write() = Some(request.clone());
        info!(endpoints = healthy.len(), "Placing subscription");

        let results = join_all(
            healthy
                .iter()
                .map(|conn| conn.open_subscription_stream(request.clone())),
        )
        .await;

        for (conn, result) in healthy.iter().zip(results) {
            if let Err(error) = result {
                warn!(endpoint = %conn.endpoint_id(), error = %error, "Stream open failed");
                if !error.is_circuit_open() {
                    self.shared.events.emit(PoolEvent::Error {
                        error: error.to_string(),
                        context: "stream-start",
                        at: chrono::Utc::now(),
                    });
                }
                let _ = self.shared.lifecycle_tx.send(LifecycleEvent::StreamOpenFailed {
                    index: conn.index(),
                    reset: error.is_reset(),
                });
            }
        }
        Ok(())
    }

    /// Receive the next merged event. Returns `None` after the pool has
    /// been dropped mid-stream, which consumers normally never observe.
    pub async fn next_event(&mut self) -> Option<PoolEvent> {
        self.event_rx.recv().await
    }

    /// Whether the pool is between `start` and `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Aggregate health report with per-endpoint detail.
    #[must_use]
    pub fn health_status(&self) -> PoolHealth {
        self.shared.health_status()
    }

    /// Data-path statistics.
    #[must_use]
    pub fn metrics(&self) -> PoolStats {
        self.shared.counters.snapshot(self.shared.dedup.len())
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }
}

impl std::fmt::Debug for SubscriptionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionPool")
            .field("running", &self.is_running())
            .field("endpoints", &self.shared.connections.len())
            .finish()
    }
}

impl Drop for SubscriptionPool {
    fn drop(&mut self) {
        // Best-effort teardown when the pool is dropped without `stop`:
        // flip the running flag so background tasks wind down, and abort
        // the pool-level tasks. Stream closure needs an async context and
        // runs in `stop` only.
        if self.shared.running.swap(false, Ordering::SeqCst) {
            let _ = self.shared.shutdown_tx.send(true);
            let mut tasks = self.shared.tasks.lock();
            if let Some(handle) = tasks.monitor.take() {
                handle.abort();
            }
            if let Some(handle) = tasks.supervisor.take() {
                handle.abort();
            }
            self.shared.dedup.stop();
        }
    }
}
