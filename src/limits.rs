//! Outbound-call guards shared by the exchange connectors.
//!
//! Every REST request passes a token-bucket rate limiter and a circuit
//! breaker. The breaker only counts transport-level failures (timeouts,
//! connection errors, 429/5xx); parse failures never trip it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// Token bucket rate limiter.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            rate,
            capacity: capacity as f64,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token, returning how long the caller must wait first.
    /// Separated from `acquire` so tests can drive the clock.
    fn reserve(&self, now: Instant) -> Option<Duration> {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            let wait = (1.0 - state.tokens) / self.rate;
            state.tokens = 0.0;
            Some(Duration::from_secs_f64(wait))
        }
    }

    /// Acquire a token, sleeping if the bucket is empty.
    pub async fn acquire(&self) {
        if let Some(wait) = self.reserve(Instant::now()) {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker: N consecutive failures open the circuit for a recovery
/// window, then a single half-open probe decides whether to close again.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: Mutex<BreakerState>,
}

struct BreakerState {
    circuit: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            state: Mutex::new(BreakerState {
                circuit: CircuitState::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may go out right now. While open, returns true once
    /// the recovery window elapsed (the half-open probe) and false for any
    /// further caller until that probe reports back.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match state.circuit {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let recovered = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    state.circuit = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.failures = 0;
        state.opened_at = None;
        state.circuit = CircuitState::Closed;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failures += 1;
        let trip = state.circuit == CircuitState::HalfOpen
            || state.failures >= self.failure_threshold;
        if trip && state.circuit != CircuitState::Open {
            state.circuit = CircuitState::Open;
            state.opened_at = Some(Instant::now());
            warn!(failures = state.failures, "circuit breaker opened");
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_allows_burst_up_to_capacity() {
        let limiter = RateLimiter::new(10.0, 20);
        let now = Instant::now();
        for _ in 0..20 {
            assert_eq!(limiter.reserve(now), None);
        }
        // 21st within the same instant must wait
        assert!(limiter.reserve(now).is_some());
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let limiter = RateLimiter::new(10.0, 20);
        let start = Instant::now();
        for _ in 0..20 {
            limiter.reserve(start);
        }
        // One second later there are ~10 tokens again
        let later = start + Duration::from_secs(1);
        for _ in 0..10 {
            assert_eq!(limiter.reserve(later), None);
        }
        assert!(limiter.reserve(later).is_some());
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let limiter = RateLimiter::new(10.0, 20);
        let start = Instant::now();
        limiter.reserve(start);
        // A long idle period refills to capacity, not beyond
        let later = start + Duration::from_secs(3600);
        for _ in 0..20 {
            assert_eq!(limiter.reserve(later), None);
        }
        assert!(limiter.reserve(later).is_some());
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            breaker.record_failure();
            assert!(breaker.allow());
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_breaker_half_open_single_probe() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(10));
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.allow());

        std::thread::sleep(Duration::from_millis(20));
        // First caller after recovery gets the probe, the next does not
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn test_breaker_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(10));
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
