//! Circuit breaker open / half-open / close cycle through the public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tributary::breaker::{BreakerMode, CircuitBreaker};
use tributary::config::CircuitBreakerConfig;
use tributary::Error;

fn config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        error_threshold_pct: 50,
        min_request_threshold: 3,
        reset_timeout_ms: 1_000,
        op_timeout_ms: 5_000,
    }
}

#[tokio::test(start_paused = true)]
async fn open_then_half_open_then_closed() {
    let breaker = CircuitBreaker::new(config());
    let attempts = AtomicU32::new(0);

    // Three failing opens trip the breaker.
    for _ in 0..3 {
        let result = breaker
            .execute(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Transport("refused".to_string()))
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.mode(), BreakerMode::Open);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // The next open is refused without attempting.
    let refused = breaker
        .execute(|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(refused, Err(Error::CircuitOpen)));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // After the reset timeout, three successes close the breaker.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    for _ in 0..3 {
        breaker
            .execute(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
    }
    assert_eq!(breaker.mode(), BreakerMode::Closed);
    assert_eq!(attempts.load(Ordering::SeqCst), 6);
}

#[tokio::test(start_paused = true)]
async fn reset_timeout_reopens_the_gate_exactly_once() {
    let breaker = CircuitBreaker::new(config());
    for _ in 0..3 {
        let _ = breaker
            .execute(|| async { Err::<(), _>(Error::Transport("refused".to_string())) })
            .await;
    }

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    // The probe runs and fails: straight back to open with a fresh stamp.
    let result = breaker
        .execute(|| async { Err::<(), _>(Error::Transport("still down".to_string())) })
        .await;
    assert!(!matches!(result, Err(Error::CircuitOpen)));
    assert_eq!(breaker.mode(), BreakerMode::Open);

    let refused = breaker.execute(|| async { Ok(()) }).await;
    assert!(matches!(refused, Err(Error::CircuitOpen)));
}
