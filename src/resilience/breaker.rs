//! Three-state circuit breaker, keyed per model tier.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Tunables for a single breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    /// Defaults tuned for the cheap/fast tier: more tolerant of transient
    /// failures before tripping.
    pub fn fast_tier() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    /// Defaults tuned for the mid/balanced tier.
    pub fn balanced_tier() -> Self {
        Self::default()
    }

    /// Defaults tuned for the flagship/powerful tier: trip fast, since each
    /// call is expensive.
    pub fn powerful_tier() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            half_open_probe_in_flight: false,
        }
    }
}

/// Point-in-time counters, safe to read under concurrent load.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerMetrics {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub state: Option<BreakerState>,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

/// Classic Closed/Open/HalfOpen breaker for a single tier.
pub struct CircuitBreaker {
    tier: String,
    config: BreakerConfig,
    inner: RwLock<Inner>,
    counters: Counters,
}

impl CircuitBreaker {
    pub fn new(tier: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            tier: tier.into(),
            config,
            inner: RwLock::new(Inner::default()),
            counters: Counters::default(),
        }
    }

    /// Current state, applying the Open -> HalfOpen transition if the
    /// recovery timeout has elapsed since opening.
    pub async fn state(&self) -> BreakerState {
        let mut inner = self.inner.write().await;
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    debug!(tier = %self.tier, "breaker recovery timeout elapsed, entering half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.half_open_probe_in_flight = false;
                }
            }
        }
        inner.state
    }

    /// Run `f` guarded by this breaker. Rejects without invoking `f` if the
    /// circuit is open, or if half-open and a probe is already in flight.
    #[instrument(skip(self, f), fields(tier = %self.tier))]
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.admit().await {
            self.counters.rejections.fetch_add(1, Ordering::Relaxed);
            return Err(Error::circuit_open(self.tier.clone()));
        }

        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        let result = f().await;

        match &result {
            Ok(_) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                self.record_success().await;
            }
            Err(_) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.record_failure().await;
            }
        }

        result
    }

    /// Decide whether a call may proceed, reserving the single half-open
    /// probe slot if applicable.
    async fn admit(&self) -> bool {
        let state = self.state().await;
        match state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                let mut inner = self.inner.write().await;
                if inner.half_open_probe_in_flight {
                    false
                } else {
                    inner.half_open_probe_in_flight = true;
                    true
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_probe_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    debug!(tier = %self.tier, "breaker closing after successful probes");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(tier = %self.tier, "breaker tripping open");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                warn!(tier = %self.tier, "probe failed, breaker re-opening");
                inner.half_open_probe_in_flight = false;
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub async fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            calls: self.counters.calls.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            state: Some(self.state().await),
        }
    }
}

/// Keyed registry of breakers, one per model tier, created lazily with
/// tier-appropriate defaults.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get (or lazily create) the breaker for `tier`.
    pub async fn get_or_create(&self, tier: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(tier) {
            return existing.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(tier.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(tier, default_config_for(tier))))
            .clone()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn default_config_for(tier: &str) -> BreakerConfig {
    match tier {
        "fast" => BreakerConfig::fast_tier(),
        "powerful" => BreakerConfig::powerful_tier(),
        _ => BreakerConfig::balanced_tier(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new(
            "fast",
            BreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                recovery_timeout: Duration::from_millis(10),
            },
        );

        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>(Error::validation("boom")) }).await;
        }

        assert_eq!(breaker.state().await, BreakerState::Open);
        let rejected = breaker.call(|| async { Ok::<_, Error>(()) }).await;
        assert!(matches!(rejected, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(
            "fast",
            BreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                recovery_timeout: Duration::from_millis(5),
            },
        );

        let _ = breaker.call(|| async { Err::<(), _>(Error::validation("boom")) }).await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        let ok = breaker.call(|| async { Ok::<_, Error>(42) }).await;
        assert_eq!(ok.unwrap(), 42);
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn registry_uses_tier_specific_defaults() {
        let registry = BreakerRegistry::new();
        let fast = registry.get_or_create("fast").await;
        let powerful = registry.get_or_create("powerful").await;
        assert_eq!(fast.config.failure_threshold, 10);
        assert_eq!(powerful.config.failure_threshold, 3);
    }
}
