//! Circuit breaker and rate limiter applied per external dependency.
//!
//! Queue workers and module invocations share these wrappers. The breaker
//! follows Closed -> Open -> HalfOpen -> Closed: it opens when the error
//! rate over a rolling call-volume window crosses a threshold, fails fast
//! while open, and admits a single trial call after the cooldown. The rate
//! limiter combines bounded concurrency, minimum inter-call spacing, and a
//! periodically refilled reservoir.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Error percentage (0-100) at which the breaker opens.
    pub error_threshold_pct: f64,
    /// Minimum calls in the window before the threshold applies.
    pub min_volume: usize,
    /// Rolling window over which outcomes are counted.
    pub window: Duration,
    /// How long the breaker stays open before admitting a trial call.
    pub open_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_pct: 50.0,
            min_volume: 10,
            window: Duration::from_secs(60),
            open_cooldown: Duration::from_secs(30),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Rejection returned while the breaker is open.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker open")]
pub struct BreakerOpen;

struct BreakerInner {
    state: BreakerState,
    /// (timestamp, was_error) outcomes within the rolling window.
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Error-rate circuit breaker with a rolling call-volume window.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Admit or reject a call.
    ///
    /// While Open, fails fast until the cooldown elapses, then transitions
    /// to HalfOpen and admits exactly one trial call.
    pub fn try_acquire(&self) -> Result<(), BreakerOpen> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        Self::prune(&mut inner.outcomes, now, self.config.window);

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("circuit breaker half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(BreakerOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(BreakerOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.outcomes.clear();
                inner.opened_at = None;
                inner.trial_in_flight = false;
                tracing::info!("circuit breaker closed after successful trial");
            }
            _ => inner.outcomes.push_back((Instant::now(), false)),
        }
    }

    /// Record a failed call, opening the breaker when the error rate over
    /// the window crosses the threshold.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                tracing::warn!("circuit breaker reopened after failed trial");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                inner.outcomes.push_back((now, true));
                Self::prune(&mut inner.outcomes, now, self.config.window);

                let total = inner.outcomes.len();
                if total >= self.config.min_volume {
                    let errors = inner.outcomes.iter().filter(|(_, e)| *e).count();
                    let rate = errors as f64 / total as f64 * 100.0;
                    if rate >= self.config.error_threshold_pct {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(now);
                        tracing::warn!(
                            errors,
                            total,
                            rate = format!("{rate:.0}%"),
                            "circuit breaker opened"
                        );
                    }
                }
            }
        }
    }

    /// Current state (pruned to the rolling window).
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    fn prune(outcomes: &mut VecDeque<(Instant, bool)>, now: Instant, window: Duration) {
        while let Some(&(t, _)) = outcomes.front() {
            if now.duration_since(t) > window {
                outcomes.pop_front();
            } else {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Limiter tuning parameters.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Maximum concurrent in-flight calls.
    pub max_concurrent: usize,
    /// Minimum spacing between consecutive call starts.
    pub min_interval: Duration,
    /// Calls admitted per refill interval.
    pub reservoir: u32,
    /// How often the reservoir refills to its full size.
    pub refill_interval: Duration,
}

impl LimiterConfig {
    /// Limiter for `per_minute` calls/minute with the given concurrency.
    pub fn per_minute(per_minute: u32, max_concurrent: usize) -> Self {
        let per_minute = per_minute.max(1);
        Self {
            max_concurrent,
            min_interval: Duration::from_secs_f64(60.0 / per_minute as f64),
            reservoir: per_minute,
            refill_interval: Duration::from_secs(60),
        }
    }
}

struct LimiterInner {
    last_start: Option<Instant>,
    tokens: u32,
    last_refill: Instant,
}

/// Concurrency bound + call spacing + reservoir refill.
pub struct RateLimiter {
    config: LimiterConfig,
    semaphore: Arc<Semaphore>,
    inner: Mutex<LimiterInner>,
}

/// Held for the duration of one rate-limited call.
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        let inner = Mutex::new(LimiterInner {
            last_start: None,
            tokens: config.reservoir,
            last_refill: Instant::now(),
        });
        Self {
            config,
            semaphore,
            inner,
        }
    }

    /// Wait until a call may start, then return the held permit.
    pub async fn acquire(&self) -> RatePermit {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("limiter semaphore closed");

        loop {
            let wait = {
                let mut inner = self.inner.lock().expect("limiter lock poisoned");
                let now = Instant::now();

                if now.duration_since(inner.last_refill) >= self.config.refill_interval {
                    inner.tokens = self.config.reservoir;
                    inner.last_refill = now;
                }

                if inner.tokens == 0 {
                    self.config
                        .refill_interval
                        .saturating_sub(now.duration_since(inner.last_refill))
                } else {
                    let since_last = inner
                        .last_start
                        .map(|t| now.duration_since(t))
                        .unwrap_or(self.config.min_interval);
                    if since_last >= self.config.min_interval {
                        inner.tokens -= 1;
                        inner.last_start = Some(now);
                        return RatePermit { _permit: permit };
                    }
                    self.config.min_interval - since_last
                }
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
