//! Retry delay schedules.
//!
//! Two distinct policies: the connection-level exponential backoff used
//! after transport failures, and the gentler staged schedule used when a
//! stream fails to start on an otherwise healthy connection.

use std::time::Duration;

use rand::Rng;

/// Ceiling for the connection-level exponential backoff.
const RECONNECT_DELAY_CAP: Duration = Duration::from_secs(30);

/// Ceiling for the stream-start retry schedule.
const STREAM_RETRY_CAP: Duration = Duration::from_secs(300);

/// Floor applied when a reset-type error triples the stream-start delay.
const RESET_DELAY_FLOOR: Duration = Duration::from_secs(10);

/// Connection reconnect backoff: `min(base · 2^attempt, 30 s)` plus up to
/// 20% jitter so redundant endpoints do not reconnect in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    base: Duration,
}

impl ReconnectBackoff {
    #[must_use]
    pub fn new(base_delay_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_delay_ms),
        }
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let scaled = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(RECONNECT_DELAY_CAP);
        scaled + jitter(scaled)
    }
}

/// Up to 20% of `base`, uniformly random.
fn jitter(base: Duration) -> Duration {
    let range_ms = base.as_millis() as u64 / 5;
    if range_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=range_ms))
}

/// Stream-start retry schedule, used when `open_subscription_stream`
/// fails on a healthy connection.
///
/// Starts gentle and flattens out: 2 s for the first five attempts, 5 s
/// for the next fifteen, 30 s thereafter. Reset-type protocol errors
/// triple the base with a 10 s floor. Capped at five minutes.
#[derive(Debug, Clone, Default)]
pub struct StreamRetryBackoff {
    attempts: u32,
}

impl StreamRetryBackoff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts recorded since the last successful stream start.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt and return the delay before the next one.
    ///
    /// `reset` marks the last observed error as a reset-type protocol
    /// error.
    pub fn next_delay(&mut self, reset: bool) -> Duration {
        self.attempts = self.attempts.saturating_add(1);

        let base = match self.attempts {
            0..=5 => Duration::from_secs(2),
            6..=20 => Duration::from_secs(5),
            _ => Duration::from_secs(30),
        };

        let delay = if reset {
            (base * 3).max(RESET_DELAY_FLOOR)
        } else {
            base
        };

        delay.min(STREAM_RETRY_CAP)
    }

    /// Clear the schedule after a successful stream start.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_doubles_then_caps() {
        let backoff = ReconnectBackoff::new(1_000);

        let assert_delay_in_range = |attempt: u32, base_ms: u64| {
            let delay = backoff.delay_for_attempt(attempt);
            let max_ms = base_ms + base_ms / 5;
            assert!(
                (base_ms..=max_ms).contains(&(delay.as_millis() as u64)),
                "attempt {attempt}: delay {delay:?} not within {base_ms}..={max_ms} ms"
            );
        };

        assert_delay_in_range(0, 1_000);
        assert_delay_in_range(1, 2_000);
        assert_delay_in_range(2, 4_000);
        assert_delay_in_range(4, 16_000);
        assert_delay_in_range(5, 30_000); // capped
        assert_delay_in_range(20, 30_000); // stays capped
    }

    #[test]
    fn test_reconnect_delay_huge_attempt_does_not_overflow() {
        let backoff = ReconnectBackoff::new(1_000);
        let delay = backoff.delay_for_attempt(u32::MAX);
        assert!(delay <= RECONNECT_DELAY_CAP + RECONNECT_DELAY_CAP / 5);
    }

    #[test]
    fn test_stream_retry_tiers() {
        let mut backoff = StreamRetryBackoff::new();

        for _ in 0..5 {
            assert_eq!(backoff.next_delay(false), Duration::from_secs(2));
        }
        for _ in 0..15 {
            assert_eq!(backoff.next_delay(false), Duration::from_secs(5));
        }
        assert_eq!(backoff.next_delay(false), Duration::from_secs(30));
    }

    #[test]
    fn test_stream_retry_reset_triples_with_floor() {
        let mut backoff = StreamRetryBackoff::new();

        // First tier base is 2 s; tripled would be 6 s, floored to 10 s.
        assert_eq!(backoff.next_delay(true), Duration::from_secs(10));

        // Push into the 5 s tier: tripled is 15 s, above the floor.
        for _ in 0..5 {
            backoff.next_delay(false);
        }
        assert_eq!(backoff.next_delay(true), Duration::from_secs(15));
    }

    #[test]
    fn test_stream_retry_reset_clears_attempts() {
        let mut backoff = StreamRetryBackoff::new();
        for _ in 0..10 {
            backoff.next_delay(false);
        }
        assert!(backoff.attempts() > 0);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(false), Duration::from_secs(2));
    }

    #[test]
    fn test_stream_retry_caps_at_five_minutes() {
        let mut backoff = StreamRetryBackoff::new();
        for _ in 0..100 {
            backoff.next_delay(false);
        }
        assert_eq!(backoff.next_delay(true), Duration::from_secs(90));
        assert!(backoff.next_delay(false) <= STREAM_RETRY_CAP);
    }
}
