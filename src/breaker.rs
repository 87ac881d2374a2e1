//! Circuit breaker gating stream acquisition per endpoint.
//!
//! Refuses attempts against an endpoint whose recent attempts have
//! overwhelmingly failed, while periodically letting a small number
//! through to detect recovery.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};

/// Successes required in `HalfOpen` before the breaker closes again.
const HALF_OPEN_QUOTA: u32 = 3;

/// Breaker mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerMode {
    /// Normal operation; attempts are allowed.
    Closed,
    /// Attempts refused until the reset timeout elapses.
    Open,
    /// Probing: a limited number of attempts run to detect recovery.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    mode: BreakerMode,
    opened_at: Option<Instant>,
    total: u64,
    failed: u64,
    consecutive_failures: u32,
    half_open_successes: u32,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            mode: BreakerMode::Closed,
            opened_at: None,
            total: 0,
            failed: 0,
            consecutive_failures: 0,
            half_open_successes: 0,
        }
    }
}

/// Three-state failure gate around stream-acquisition attempts.
///
/// Failure ratios are cumulative: a success never reduces the failure
/// count, so long-lived deployments that want a clean slate call
/// [`reset`](Self::reset).
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    /// Run `op` under the breaker's wall-clock deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] without invoking `op` while the
    /// breaker is open and the reset timeout has not elapsed. A deadline
    /// expiry counts as a failure and returns [`Error::Timeout`]. All
    /// other errors are `op`'s own.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_gate()?;

        let deadline = Duration::from_millis(self.config.op_timeout_ms);
        match tokio::time::timeout(deadline, op()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(error)) => {
                self.record_failure();
                Err(error)
            }
            Err(_) => {
                self.record_failure();
                Err(Error::Timeout(deadline))
            }
        }
    }

    /// Current mode, for metrics and tests.
    #[must_use]
    pub fn mode(&self) -> BreakerMode {
        self.state.lock().mode
    }

    /// Manually clear all counters and close the breaker.
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::new();
    }

    fn check_gate(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.mode != BreakerMode::Open {
            return Ok(());
        }

        let reset_after = Duration::from_millis(self.config.reset_timeout_ms);
        let elapsed = state
            .opened_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed < reset_after {
            return Err(Error::CircuitOpen);
        }

        debug!("Reset timeout elapsed, probing half-open");
        state.mode = BreakerMode::HalfOpen;
        state.half_open_successes = 0;
        Ok(())
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        match state.mode {
            BreakerMode::Closed => {
                state.total += 1;
                state.consecutive_failures = 0;
            }
            BreakerMode::HalfOpen => {
                state.half_open_successes += 1;
                if state.half_open_successes >= HALF_OPEN_QUOTA {
                    debug!(
                        successes = state.half_open_successes,
                        "Recovery confirmed, closing breaker"
                    );
                    *state = BreakerState::new();
                }
            }
            // The gate never runs an op while open.
            BreakerMode::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        match state.mode {
            BreakerMode::Closed => {
                state.total += 1;
                state.failed += 1;
                state.consecutive_failures += 1;

                let past_gate = state.total >= self.config.min_request_threshold;
                let ratio_pct = state.failed.saturating_mul(100) / state.total.max(1);
                if past_gate && ratio_pct >= u64::from(self.config.error_threshold_pct) {
                    warn!(
                        total = state.total,
                        failed = state.failed,
                        consecutive = state.consecutive_failures,
                        "Failure ratio exceeded, opening breaker"
                    );
                    state.mode = BreakerMode::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            BreakerMode::HalfOpen => {
                state.mode = BreakerMode::Open;
                state.opened_at = Some(Instant::now());
                state.half_open_successes = 0;
            }
            BreakerMode::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            error_threshold_pct: 50,
            min_request_threshold: 3,
            reset_timeout_ms: 1_000,
            op_timeout_ms: 5_000,
        }
    }

    async fn failing(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .execute(|| async { Err::<(), _>(Error::Transport("boom".to_string())) })
            .await
    }

    async fn succeeding(breaker: &CircuitBreaker) -> Result<()> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_stays_closed_below_request_threshold() {
        let breaker = CircuitBreaker::new(test_config());

        failing(&breaker).await.unwrap_err();
        failing(&breaker).await.unwrap_err();

        assert_eq!(breaker.mode(), BreakerMode::Closed);
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(test_config());

        for _ in 0..3 {
            failing(&breaker).await.unwrap_err();
        }

        assert_eq!(breaker.mode(), BreakerMode::Open);
    }

    #[tokio::test]
    async fn test_open_refuses_without_invoking() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            failing(&breaker).await.unwrap_err();
        }

        let invoked = std::sync::atomic::AtomicBool::new(false);
        let result = breaker
            .execute(|| async {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen)));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_quota() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            failing(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.mode(), BreakerMode::Open);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        succeeding(&breaker).await.unwrap();
        assert_eq!(breaker.mode(), BreakerMode::HalfOpen);
        succeeding(&breaker).await.unwrap();
        succeeding(&breaker).await.unwrap();

        assert_eq!(breaker.mode(), BreakerMode::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            failing(&breaker).await.unwrap_err();
        }

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        succeeding(&breaker).await.unwrap();
        assert_eq!(breaker.mode(), BreakerMode::HalfOpen);
        failing(&breaker).await.unwrap_err();

        assert_eq!(breaker.mode(), BreakerMode::Open);

        // The fresh open stamp starts a new cooldown.
        let result = succeeding(&breaker).await;
        assert!(matches!(result, Err(Error::CircuitOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let config = CircuitBreakerConfig {
            op_timeout_ms: 100,
            ..test_config()
        };
        let breaker = CircuitBreaker::new(config);

        for _ in 0..3 {
            let result = breaker
                .execute(|| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                })
                .await;
            assert!(matches!(result, Err(Error::Timeout(_))));
        }

        assert_eq!(breaker.mode(), BreakerMode::Open);
    }

    #[tokio::test]
    async fn test_success_never_reduces_failed_count() {
        // 2 failures then 2 successes: ratio is 2/4 = 50%, still at the
        // threshold, so the next failure opens the breaker.
        let breaker = CircuitBreaker::new(test_config());

        failing(&breaker).await.unwrap_err();
        failing(&breaker).await.unwrap_err();
        succeeding(&breaker).await.unwrap();
        succeeding(&breaker).await.unwrap();
        assert_eq!(breaker.mode(), BreakerMode::Closed);

        failing(&breaker).await.unwrap_err();
        assert_eq!(breaker.mode(), BreakerMode::Open);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            failing(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.mode(), BreakerMode::Open);

        breaker.reset();
        assert_eq!(breaker.mode(), BreakerMode::Closed);
        succeeding(&breaker).await.unwrap();
    }
}
