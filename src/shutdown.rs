//! Process-wide graceful shutdown coordination.
//!
//! Signal handlers are process-global state, so a library must install
//! them exactly once no matter how many pools a process runs. The first
//! pool to start registers here and triggers the one-time installation;
//! later pools only join the set.
//!
//! On a termination signal every registered pool is stopped concurrently
//! under a single deadline, then the process exits: status 0 for a
//! signal, 1 for the fault path (a panic observed by the hook).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::pool::PoolShared;

/// Overall deadline for stopping every pool on a signal.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

static COORDINATOR: OnceLock<ShutdownCoordinator> = OnceLock::new();

/// The process-wide coordinator singleton.
pub fn coordinator() -> &'static ShutdownCoordinator {
    COORDINATOR.get_or_init(ShutdownCoordinator::new)
}

/// Why the listener is shutting the process down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownCause {
    /// A termination signal (Ctrl-C / SIGTERM). Exit status 0.
    Signal,
    /// A terminal fault (panic observed by the hook). Exit status 1.
    Fault,
}

/// Registry of running pools plus the once-only signal listener.
pub struct ShutdownCoordinator {
    pools: Mutex<Vec<Weak<PoolShared>>>,
    installed: AtomicBool,
    fired: AtomicBool,
    fault_tx: mpsc::UnboundedSender<ShutdownCause>,
    fault_rx: Mutex<Option<mpsc::UnboundedReceiver<ShutdownCause>>>,
}

impl ShutdownCoordinator {
    fn new() -> Self {
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        Self {
            pools: Mutex::new(Vec::new()),
            installed: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            fault_tx,
            fault_rx: Mutex::new(Some(fault_rx)),
        }
    }

    /// Add a pool to the shutdown set. The first registration in the
    /// process installs the signal handlers and the panic hook.
    pub(crate) fn register(&'static self, pool: &Arc<PoolShared>) {
        {
            let mut pools = self.pools.lock();
            pools.retain(|weak| weak.strong_count() > 0);
            pools.push(Arc::downgrade(pool));
        }

        if self.installed.swap(true, Ordering::SeqCst) {
            return;
        }

        let previous_hook = std::panic::take_hook();
        let fault_tx = self.fault_tx.clone();
        std::panic::set_hook(Box::new(move |info| {
            previous_hook(info);
            let _ = fault_tx.send(ShutdownCause::Fault);
        }));

        let fault_rx = self.fault_rx.lock().take();
        if let Some(fault_rx) = fault_rx {
            tokio::spawn(self.listen(fault_rx));
        }
    }

    /// Stop every registered pool without exiting the process. A no-op
    /// after the first call.
    pub async fn shutdown(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_all().await;
    }

    /// Inject a shutdown cause as if a signal had arrived. The listener
    /// will stop every pool and exit the process; intended for harnesses
    /// that supervise a child process.
    #[cfg(any(test, feature = "testkit"))]
    pub fn inject_signal(&self, fault: bool) {
        let cause = if fault {
            ShutdownCause::Fault
        } else {
            ShutdownCause::Signal
        };
        let _ = self.fault_tx.send(cause);
    }

    async fn listen(&'static self, mut fault_rx: mpsc::UnboundedReceiver<ShutdownCause>) {
        let cause = tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownCause::Signal,
            _ = terminate_signal() => ShutdownCause::Signal,
            Some(cause) = fault_rx.recv() => cause,
        };

        info!(?cause, "Shutdown signal received, stopping all pools");
        self.fired.store(true, Ordering::SeqCst);
        self.stop_all().await;

        std::process::exit(match cause {
            ShutdownCause::Signal => 0,
            ShutdownCause::Fault => 1,
        });
    }

    async fn stop_all(&self) {
        let pools: Vec<Arc<PoolShared>> = self
            .pools
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        if pools.is_empty() {
            return;
        }

        info!(pools = pools.len(), "Stopping registered pools");
        let stopping = join_all(pools.iter().map(|pool| pool.shutdown()));
        if tokio::time::timeout(SHUTDOWN_DEADLINE, stopping).await.is_err() {
            warn!("Shutdown deadline reached before all pools stopped");
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(error) => {
            warn!(error = %error, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{self, transport::MockTransport};
    use crate::SubscriptionPool;

    // These tests build their own coordinator rather than touching the
    // process-wide singleton, which other tests' pools register with.

    async fn started_pool(address: &str) -> SubscriptionPool {
        let pool = SubscriptionPool::new(
            testkit::config::pool(&[address]),
            MockTransport::new(),
        )
        .unwrap();
        pool.start().await.unwrap();
        pool
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_shutdown_stops_every_registered_pool() {
        let coordinator = ShutdownCoordinator::new();
        let first = started_pool("mock://sd1").await;
        let second = started_pool("mock://sd2").await;
        coordinator
            .pools
            .lock()
            .extend([Arc::downgrade(first.shared()), Arc::downgrade(second.shared())]);

        coordinator.shutdown().await;

        assert!(!first.is_running());
        assert!(!second.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_a_no_op_after_the_first_call() {
        let coordinator = ShutdownCoordinator::new();
        let pool = started_pool("mock://sd3").await;
        coordinator.pools.lock().push(Arc::downgrade(pool.shared()));

        coordinator.shutdown().await;
        assert!(!pool.is_running());

        // Restart; the second shutdown call must leave it alone.
        pool.start().await.unwrap();
        coordinator.shutdown().await;
        assert!(pool.is_running());
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_pools_are_skipped() {
        let coordinator = ShutdownCoordinator::new();
        {
            let pool = started_pool("mock://sd4").await;
            coordinator.pools.lock().push(Arc::downgrade(pool.shared()));
            pool.stop().await;
        }

        // The weak reference is dead; shutdown must not hang or panic.
        coordinator.shutdown().await;
    }
}
