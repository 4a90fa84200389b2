//! Circuit breaker for quota/rate failures.
//!
//! Opens after a configurable number of consecutive failures (default: the
//! very first one) and blocks all outbound calls for a cooldown window. The
//! breaker closes by clock expiry alone; no explicit re-arm is required. A
//! long enough failure-free gap silently forgives the streak on the next
//! success check.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// How long the breaker stays open.
    pub cooldown_period: Duration,
    /// Failure-free gap after which the streak is forgiven.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            cooldown_period: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(300),
        }
    }
}

/// Observable breaker state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub is_open: bool,
    pub failure_count: u32,
}

#[derive(Debug, Default)]
struct Inner {
    is_open: bool,
    open_until: Option<Instant>,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Trips on quota failures, blocks calls for a cooldown, closes on expiry.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record a successful call. Forgives an old failure streak when the last
    /// failure is older than `reset_timeout`.
    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    fn record_success_at(&self, now: Instant) {
        let mut inner = self.lock();
        if !inner.is_open && inner.failure_count > 0 {
            if let Some(last) = inner.last_failure {
                if now.duration_since(last) > self.config.reset_timeout {
                    inner.failure_count = 0;
                    inner.last_failure = None;
                }
            }
        }
    }

    /// Record a quota failure; opens the breaker once the threshold is met.
    pub fn record_failure(&self) {
        self.record_failure_with_hint(None);
    }

    /// Record a failure, honoring a provider retry-delay hint for the open
    /// window when one is present.
    pub fn record_failure_with_hint(&self, retry_after: Option<Duration>) {
        self.record_failure_at(Instant::now(), retry_after);
    }

    fn record_failure_at(&self, now: Instant, retry_after: Option<Duration>) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(now);
        if inner.failure_count >= self.config.failure_threshold {
            let window = retry_after.unwrap_or(self.config.cooldown_period);
            inner.is_open = true;
            inner.open_until = Some(now + window);
            warn!(
                failures = inner.failure_count,
                open_secs = window.as_secs(),
                "circuit breaker opened"
            );
        }
    }

    /// Whether an outbound call may proceed. An expired open window reads as
    /// closed and clears the open flag.
    pub fn can_proceed(&self) -> bool {
        self.can_proceed_at(Instant::now())
    }

    fn can_proceed_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        if !inner.is_open {
            return true;
        }
        match inner.open_until {
            Some(until) if now >= until => {
                inner.is_open = false;
                inner.open_until = None;
                info!("circuit breaker closed (cooldown elapsed)");
                true
            }
            Some(_) => false,
            // is_open without a deadline should not happen; fail closed.
            None => false,
        }
    }

    /// Time remaining until the breaker closes, if it is open.
    pub fn time_until_close(&self) -> Option<Duration> {
        let inner = self.lock();
        if !inner.is_open {
            return None;
        }
        let until = inner.open_until?;
        let now = Instant::now();
        (until > now).then(|| until.duration_since(now))
    }

    /// Snapshot for logging/UI.
    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            is_open: inner.is_open,
            failure_count: inner.failure_count,
        }
    }

    /// Return to the documented initial state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = Inner::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
