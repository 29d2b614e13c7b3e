//! Adaptive request pacing for upstream TTS calls.
//!
//! Each provider instance owns one limiter. Pacing combines a fixed minimum
//! inter-request interval with an adaptive penalty: the penalty doubles on
//! every throttling response (HTTP 429/503) and decays multiplicatively on
//! sustained success. Bounded concurrency with FIFO waiting is handled
//! separately by the request manager's semaphore.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Penalty floor applied on the first throttling response.
const INITIAL_PENALTY: Duration = Duration::from_millis(250);
/// Penalties below this decay straight to zero.
const PENALTY_EPSILON: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct LimiterState {
    /// Earliest instant the next request may start.
    next_slot: Option<Instant>,
    /// Adaptive delay added on top of the minimum interval.
    penalty: Duration,
}

/// Minimum-interval pacer with adaptive backoff on throttling.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Mutex<Duration>,
    max_penalty: Duration,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval: Mutex::new(min_interval),
            max_penalty: Duration::from_secs(60),
            state: Mutex::new(LimiterState {
                next_slot: None,
                penalty: Duration::ZERO,
            }),
        }
    }

    /// Wait until this request's slot. Slots are handed out in call order;
    /// each one reserves `min_interval + penalty` after itself.
    pub async fn acquire(&self) {
        let wait = {
            let interval = *self.min_interval.lock() + self.current_penalty();
            let mut state = self.state.lock();
            let now = Instant::now();
            let slot = match state.next_slot {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            state.next_slot = Some(slot + interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter pacing request");
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a throttling response: double the adaptive penalty.
    pub fn on_throttled(&self) {
        let mut state = self.state.lock();
        let doubled = if state.penalty.is_zero() {
            INITIAL_PENALTY
        } else {
            state.penalty.saturating_mul(2)
        };
        state.penalty = doubled.min(self.max_penalty);
        debug!(penalty_ms = state.penalty.as_millis() as u64, "rate limiter penalty grown");
    }

    /// Record a successful call: decay the penalty multiplicatively.
    pub fn on_success(&self) {
        let mut state = self.state.lock();
        if state.penalty.is_zero() {
            return;
        }
        let decayed = state.penalty / 2;
        state.penalty = if decayed < PENALTY_EPSILON {
            Duration::ZERO
        } else {
            decayed
        };
    }

    /// Current adaptive penalty (excludes the fixed minimum interval).
    pub fn current_penalty(&self) -> Duration {
        self.state.lock().penalty
    }

    /// Replace the minimum inter-request interval.
    pub fn set_min_interval(&self, interval: Duration) {
        *self.min_interval.lock() = interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_penalty_doubles_on_throttling() {
        let limiter = RateLimiter::new(Duration::ZERO);
        assert_eq!(limiter.current_penalty(), Duration::ZERO);

        limiter.on_throttled();
        assert_eq!(limiter.current_penalty(), INITIAL_PENALTY);

        limiter.on_throttled();
        assert_eq!(limiter.current_penalty(), INITIAL_PENALTY * 2);

        limiter.on_throttled();
        assert_eq!(limiter.current_penalty(), INITIAL_PENALTY * 4);
    }

    #[test]
    fn test_penalty_is_capped() {
        let limiter = RateLimiter::new(Duration::ZERO);
        for _ in 0..32 {
            limiter.on_throttled();
        }
        assert_eq!(limiter.current_penalty(), Duration::from_secs(60));
    }

    #[test]
    fn test_penalty_decays_on_success() {
        let limiter = RateLimiter::new(Duration::ZERO);
        limiter.on_throttled();
        limiter.on_throttled();
        let grown = limiter.current_penalty();

        limiter.on_success();
        assert_eq!(limiter.current_penalty(), grown / 2);

        // Sustained success drives it back to zero
        for _ in 0..16 {
            limiter.on_success();
        }
        assert_eq!(limiter.current_penalty(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_spaces_out_requests() {
        let limiter = RateLimiter::new(Duration::from_millis(100));

        let started = tokio::time::Instant::now();
        limiter.acquire().await; // first request is immediate
        limiter.acquire().await; // second waits out the interval
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_acquire_without_interval_is_immediate() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let started = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
