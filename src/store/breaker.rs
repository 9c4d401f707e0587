//! Circuit breaker for state-store calls.
//!
//! Counts consecutive transport-kind failures (connection refused, pool
//! exhausted, timeout). At the threshold the breaker opens and every call
//! fails fast for the recovery window; the first call past the window runs
//! as a half-open probe and a success closes the circuit again. Any
//! non-transport error passes through without moving the breaker.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub circuit_open_count: u64,
}

/// Introspection snapshot for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_window_secs: u64,
    pub stats: BreakerStats,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    stats: BreakerStats,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_window: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_window: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_window,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                stats: BreakerStats::default(),
            }),
        }
    }

    /// Returns whether the caller may proceed. While open, only the first
    /// call past the recovery window is admitted (as the half-open probe);
    /// while the probe is outstanding everything else is rejected.
    pub fn try_acquire(&self) -> bool {
        let mut g = self.inner.lock().unwrap();
        g.stats.total_calls += 1;
        match g.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                g.stats.rejected_calls += 1;
                false
            }
            BreakerState::Open => {
                let elapsed = g
                    .last_failure
                    .map(|t| t.elapsed() >= self.recovery_window)
                    .unwrap_or(true);
                if elapsed {
                    g.state = BreakerState::HalfOpen;
                    true
                } else {
                    g.stats.rejected_calls += 1;
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut g = self.inner.lock().unwrap();
        g.consecutive_failures = 0;
        g.stats.successful_calls += 1;
        if g.state != BreakerState::Closed {
            g.state = BreakerState::Closed;
        }
    }

    pub fn on_transport_failure(&self) {
        let mut g = self.inner.lock().unwrap();
        g.consecutive_failures += 1;
        g.last_failure = Some(Instant::now());
        g.stats.failed_calls += 1;
        let tripped = g.consecutive_failures >= self.failure_threshold
            || g.state == BreakerState::HalfOpen;
        if tripped && g.state != BreakerState::Open {
            g.state = BreakerState::Open;
            g.stats.circuit_open_count += 1;
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().state == BreakerState::Open
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let g = self.inner.lock().unwrap();
        BreakerSnapshot {
            state: g.state,
            consecutive_failures: g.consecutive_failures,
            failure_threshold: self.failure_threshold,
            recovery_window_secs: self.recovery_window.as_secs(),
            stats: g.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_and_fails_fast() {
        let b = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(b.try_acquire());
            b.on_transport_failure();
        }
        assert!(b.is_open());
        // Within the recovery window every call is rejected without touching
        // the transport.
        assert!(!b.try_acquire());
        assert!(!b.try_acquire());
    }

    #[test]
    fn first_call_after_window_is_the_probe() {
        let b = CircuitBreaker::new(1, Duration::from_millis(0));
        assert!(b.try_acquire());
        b.on_transport_failure();
        // Window of zero: the very next call is admitted as the probe...
        assert!(b.try_acquire());
        // ...and while the probe is outstanding, nothing else gets through.
        assert!(!b.try_acquire());
        b.on_success();
        assert!(b.try_acquire());
        assert!(!b.is_open());
    }

    #[test]
    fn failed_probe_reopens() {
        let b = CircuitBreaker::new(1, Duration::from_millis(0));
        assert!(b.try_acquire());
        b.on_transport_failure();
        assert!(b.try_acquire()); // probe
        b.on_transport_failure();
        assert!(b.is_open());
    }

    #[test]
    fn success_resets_consecutive_count() {
        let b = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(b.try_acquire());
        b.on_transport_failure();
        assert!(b.try_acquire());
        b.on_transport_failure();
        assert!(b.try_acquire());
        b.on_success();
        // Two failures then a success: counter is back to zero.
        assert!(b.try_acquire());
        b.on_transport_failure();
        assert!(!b.is_open());
    }
}
