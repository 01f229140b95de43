//! Client-side request governance for remote annotation backends.
//!
//! Each backend may carry a request pacing limit (token bucket, leaky
//! bucket, or fixed window) and a concurrency ceiling. The pacing rate comes
//! from `qps` directly or is derived from `rpm / 60`, so both spellings feed
//! the same strategy. [`CompositeController`] applies whichever subset is
//! configured; `acquire` blocks until every active limit grants passage and
//! returns a [`RatePermit`] whose drop releases the concurrency slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Which algorithm paces the per-second request rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateStrategy {
    /// Refill-on-demand bucket allowing short bursts up to the burst size.
    #[default]
    TokenBucket,
    /// Level meter draining at the configured rate; admits bursts up to
    /// capacity, then blocks until the bucket drains a slot.
    LeakyBucket,
    /// At most the configured count per fixed window (one second for `qps`,
    /// one minute for `rpm`).
    FixedWindow,
}

/// Per-backend rate configuration, usually deserialized from the backend
/// section of the run configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per second. `None` disables per-second pacing.
    #[serde(default)]
    pub qps: Option<f64>,
    /// Requests per minute, converted to `rpm / 60` requests per second and
    /// paced by the configured strategy. Mutually exclusive with `qps`.
    #[serde(default)]
    pub rpm: Option<u32>,
    /// Maximum in-flight requests. `None` disables the concurrency ceiling.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    /// Pacing algorithm for the request rate.
    #[serde(default)]
    pub strategy: RateStrategy,
    /// Bucket capacity for the token and leaky strategies. Defaults to
    /// `2 * rate`, minimum 1.
    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimitConfig {
    /// Whether any governing limit is configured at all.
    pub fn is_active(&self) -> bool {
        self.qps.is_some() || self.rpm.is_some() || self.max_concurrent.is_some()
    }
}

/// Bucket capacity shared by the token and leaky strategies.
fn bucket_capacity(rate: f64, burst: Option<u32>) -> f64 {
    match burst {
        Some(b) => f64::from(b.max(1)),
        None => (rate * 2.0).max(1.0),
    }
}

/// Classic token bucket with lazy refill at acquire time.
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<TokenBucketState>,
}

struct TokenBucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: Option<u32>) -> Self {
        let capacity = bucket_capacity(rate, burst);
        Self {
            capacity,
            refill_per_sec: rate,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens =
                    (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                (1.0 - state.tokens) / self.refill_per_sec
            };
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    async fn snapshot(&self) -> StrategySnapshot {
        let state = self.state.lock().await;
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        StrategySnapshot::TokenBucket {
            tokens: (state.tokens + elapsed * self.refill_per_sec).min(self.capacity),
            capacity: self.capacity,
        }
    }
}

/// Leaky bucket as a level meter: each request adds one unit, the level
/// drains at the configured rate, and requests block only while the bucket
/// is full. Bursts up to capacity pass untouched.
struct LeakyBucket {
    capacity: f64,
    drain_per_sec: f64,
    state: Mutex<LeakyBucketState>,
}

struct LeakyBucketState {
    level: f64,
    last_drain: Instant,
}

impl LeakyBucket {
    fn new(rate: f64, burst: Option<u32>) -> Self {
        Self {
            capacity: bucket_capacity(rate, burst),
            drain_per_sec: rate,
            state: Mutex::new(LeakyBucketState {
                level: 0.0,
                last_drain: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_drain).as_secs_f64();
                state.level = (state.level - elapsed * self.drain_per_sec).max(0.0);
                state.last_drain = now;
                if state.level + 1.0 <= self.capacity {
                    state.level += 1.0;
                    return;
                }
                (state.level + 1.0 - self.capacity) / self.drain_per_sec
            };
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    async fn snapshot(&self) -> StrategySnapshot {
        let state = self.state.lock().await;
        let elapsed = state.last_drain.elapsed().as_secs_f64();
        StrategySnapshot::LeakyBucket {
            level: (state.level - elapsed * self.drain_per_sec).max(0.0),
            capacity: self.capacity,
        }
    }
}

/// Fixed window counter: at most `limit` acquisitions per `window`, then
/// sleep until the window rolls over.
struct FixedWindow {
    limit: u64,
    window: Duration,
    state: Mutex<FixedWindowState>,
}

struct FixedWindowState {
    window_start: Instant,
    count: u64,
}

impl FixedWindow {
    fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(FixedWindowState {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if now.duration_since(state.window_start) >= self.window {
                    state.window_start = now;
                    state.count = 0;
                }
                if state.count < self.limit {
                    state.count += 1;
                    return;
                }
                self.window - now.duration_since(state.window_start)
            };
            tokio::time::sleep(wait).await;
        }
    }

    async fn snapshot(&self) -> StrategySnapshot {
        let state = self.state.lock().await;
        let count = if state.window_start.elapsed() >= self.window {
            0
        } else {
            state.count
        };
        StrategySnapshot::FixedWindow {
            count,
            limit: self.limit,
        }
    }
}

enum RateLimiter {
    Token(TokenBucket),
    Leaky(LeakyBucket),
    Window(FixedWindow),
}

impl RateLimiter {
    async fn acquire(&self) {
        match self {
            RateLimiter::Token(b) => b.acquire().await,
            RateLimiter::Leaky(b) => b.acquire().await,
            RateLimiter::Window(w) => w.acquire().await,
        }
    }

    async fn snapshot(&self) -> StrategySnapshot {
        match self {
            RateLimiter::Token(b) => b.snapshot().await,
            RateLimiter::Leaky(b) => b.snapshot().await,
            RateLimiter::Window(w) => w.snapshot().await,
        }
    }
}

/// Point-in-time view of the pacing strategy's internal state.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategySnapshot {
    TokenBucket { tokens: f64, capacity: f64 },
    LeakyBucket { level: f64, capacity: f64 },
    FixedWindow { count: u64, limit: u64 },
}

/// Grant returned by [`CompositeController::acquire`]. Holds the concurrency
/// slot, if one was configured, until dropped.
pub struct RatePermit {
    _concurrency: Option<OwnedSemaphorePermit>,
}

/// Point-in-time counters for logging and the completion summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateStats {
    /// Total permits granted over the controller's lifetime.
    pub total_acquired: u64,
    /// Acquisitions that had to wait on at least one limit.
    pub total_waited: u64,
    /// Cumulative seconds spent waiting on limits.
    pub total_wait_secs: f64,
    /// Free concurrency slots at snapshot time, when a ceiling is set.
    pub available_concurrency: Option<usize>,
}

/// Builds the pacing limiter named by `config.strategy`. The rate comes
/// from `qps` directly or from `rpm / 60`; the fixed-window strategy keeps
/// the full window (one second for `qps`, one minute for `rpm`) instead of
/// spreading the quota.
fn build_limiter(config: &RateLimitConfig) -> Option<RateLimiter> {
    let (rate, window) = match (config.qps, config.rpm) {
        (Some(qps), _) if qps > 0.0 => (qps, Duration::from_secs(1)),
        (None, Some(rpm)) if rpm > 0 => (f64::from(rpm) / 60.0, Duration::from_secs(60)),
        _ => return None,
    };
    Some(match config.strategy {
        RateStrategy::TokenBucket => RateLimiter::Token(TokenBucket::new(rate, config.burst)),
        RateStrategy::LeakyBucket => RateLimiter::Leaky(LeakyBucket::new(rate, config.burst)),
        RateStrategy::FixedWindow => {
            let limit = (rate * window.as_secs_f64()).round().max(1.0) as u64;
            RateLimiter::Window(FixedWindow::new(limit, window))
        }
    })
}

/// Applies every configured limit for one backend in a fixed order:
/// concurrency slot first, then the request pacer.
pub struct CompositeController {
    backend: String,
    rate: Option<RateLimiter>,
    concurrency: Option<Arc<Semaphore>>,
    stats: Mutex<RateStats>,
}

impl CompositeController {
    pub fn new(backend: &str, config: &RateLimitConfig) -> Self {
        let rate = build_limiter(config);
        let concurrency = config
            .max_concurrent
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));

        info!(
            backend,
            qps = ?config.qps,
            rpm = ?config.rpm,
            max_concurrent = ?config.max_concurrent,
            strategy = ?config.strategy,
            "Rate controller configured"
        );

        Self {
            backend: backend.to_string(),
            rate,
            concurrency,
            stats: Mutex::new(RateStats::default()),
        }
    }

    /// Blocks until every configured limit grants passage.
    ///
    /// The returned permit must be held for the duration of the request so
    /// the concurrency slot is released only after the response arrives.
    pub async fn acquire(&self) -> RatePermit {
        let started = Instant::now();

        let concurrency = match &self.concurrency {
            // Semaphore is never closed, so acquisition cannot fail.
            Some(sem) => Arc::clone(sem).acquire_owned().await.ok(),
            None => None,
        };
        if let Some(rate) = &self.rate {
            rate.acquire().await;
        }

        let waited = started.elapsed();
        {
            let mut stats = self.stats.lock().await;
            stats.total_acquired += 1;
            if waited > Duration::from_millis(1) {
                stats.total_waited += 1;
                stats.total_wait_secs += waited.as_secs_f64();
            }
        }
        if waited > Duration::from_millis(100) {
            debug!(
                backend = %self.backend,
                waited_ms = waited.as_millis() as u64,
                "Request delayed by rate limits"
            );
        }

        RatePermit {
            _concurrency: concurrency,
        }
    }

    /// Snapshot of the controller's counters.
    pub async fn stats(&self) -> RateStats {
        let mut stats = self.stats.lock().await.clone();
        stats.available_concurrency = self
            .concurrency
            .as_ref()
            .map(|sem| sem.available_permits());
        stats
    }

    /// Internal state of the pacing strategy, if one is configured.
    pub async fn strategy_snapshot(&self) -> Option<StrategySnapshot> {
        match &self.rate {
            Some(rate) => Some(rate.snapshot().await),
            None => None,
        }
    }
}
