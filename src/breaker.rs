//! Per-backend circuit breaking.
//!
//! A breaker starts closed and opens after `fail_max` consecutive failures.
//! Once `reset_timeout` has elapsed the next caller is admitted as a
//! half-open probe: success closes the breaker, failure reopens it and
//! restarts the timeout. Callers wrap the governed call with `try_acquire`
//! before it and `record_success` / `record_failure` after.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{info, warn};

/// Breaker tuning, per backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_fail_max")]
    pub fail_max: u32,
    /// Seconds to hold the breaker open before admitting a probe.
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,
}

fn default_fail_max() -> u32 {
    5
}

fn default_reset_timeout() -> u64 {
    60
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_max: default_fail_max(),
            reset_timeout_secs: default_reset_timeout(),
        }
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker for one backend.
pub struct CircuitBreaker {
    backend: String,
    fail_max: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(backend: &str, config: &BreakerConfig) -> Self {
        Self {
            backend: backend.to_string(),
            fail_max: config.fail_max.max(1),
            reset_timeout: Duration::from_secs(config.reset_timeout_secs),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned lock only means a panic mid-update; the state fields are
        // individually valid, so continue with whatever is there.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Asks whether a call may proceed. `Err` carries the remaining open
    /// time when the breaker refuses.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.reset_timeout);
                if elapsed >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    info!(backend = %self.backend, "Circuit breaker admitting probe request");
                    Ok(())
                } else {
                    Err(self.reset_timeout - elapsed)
                }
            }
        }
    }

    /// Records a successful call, closing the breaker from any state.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!(backend = %self.backend, from = %inner.state, "Circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Records a failed call. A half-open probe failure reopens immediately;
    /// in the closed state the breaker opens once the failure streak reaches
    /// the configured maximum.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let should_open = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.fail_max,
            BreakerState::Open => false,
        };
        if should_open {
            warn!(
                backend = %self.backend,
                failures = inner.consecutive_failures,
                reset_secs = self.reset_timeout.as_secs(),
                "Circuit breaker opened"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Current state, with the open-to-half-open transition applied lazily.
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        if inner.state == BreakerState::Open {
            if let Some(at) = inner.opened_at {
                if at.elapsed() >= self.reset_timeout {
                    return BreakerState::HalfOpen;
                }
            }
        }
        inner.state
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }
}

/// Shared cache of breakers keyed by backend id, so every service handle for
/// a backend observes the same failure history.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the backend's breaker, creating it from `config` on first use.
    pub fn get_or_create(
        &self,
        backend: &str,
        config: &BreakerConfig,
    ) -> std::sync::Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(backend.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(backend, config)))
            .clone()
    }
}
