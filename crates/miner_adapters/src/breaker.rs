//! Circuit breaker for the upstream release registry.
//!
//! Three states: closed (calls pass through), open (calls short-circuit,
//! optionally serving a cached result), half-open (probing). While open, a
//! cached success fresher than the cache TTL is returned instead of an
//! error, so a flapping upstream degrades to slightly stale answers.

use crate::{MinerError, Result};
use std::future::Future;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    pub cache_ttl: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}

struct Inner<T> {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
    cache: Option<(T, Instant)>,
}

pub struct CircuitBreaker<T: Clone> {
    config: BreakerConfig,
    inner: RwLock<Inner<T>>,
}

impl<T: Clone> CircuitBreaker<T> {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
                cache: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Force closed and clear counters. The cache survives.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.last_failure = None;
    }

    /// Run `op` under the breaker. In the open state the wrapped operation
    /// is never invoked: a fresh cached result or `CircuitOpen` comes back
    /// instead.
    pub async fn execute<F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Decide what to do under the lock, run the operation outside it.
        enum Plan<T> {
            Run,
            Probe,
            Cached(T),
            Rejected,
        }

        let plan = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            match inner.state {
                BreakerState::Closed => Plan::Run,
                BreakerState::HalfOpen => Plan::Probe,
                BreakerState::Open => {
                    let elapsed = inner
                        .last_failure
                        .map(|t| t.elapsed())
                        .unwrap_or(Duration::MAX);
                    if elapsed > self.config.reset_timeout {
                        inner.state = BreakerState::HalfOpen;
                        inner.successes = 0;
                        debug!("circuit breaker: open -> half-open");
                        Plan::Probe
                    } else if let Some((value, at)) = &inner.cache {
                        if at.elapsed() < self.config.cache_ttl {
                            Plan::Cached(value.clone())
                        } else {
                            Plan::Rejected
                        }
                    } else {
                        Plan::Rejected
                    }
                }
            }
        };

        match plan {
            Plan::Cached(value) => Ok(value),
            Plan::Rejected => Err(MinerError::CircuitOpen),
            Plan::Run => {
                let result = op().await;
                let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
                match result {
                    Ok(value) => {
                        inner.failures = 0;
                        inner.cache = Some((value.clone(), Instant::now()));
                        Ok(value)
                    }
                    Err(e) => {
                        inner.failures += 1;
                        if inner.failures >= self.config.failure_threshold {
                            inner.state = BreakerState::Open;
                            inner.last_failure = Some(Instant::now());
                            warn!("circuit breaker opened after {} failures", inner.failures);
                        }
                        Err(e)
                    }
                }
            }
            Plan::Probe => {
                let result = op().await;
                let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
                match result {
                    Ok(value) => {
                        inner.successes += 1;
                        inner.cache = Some((value.clone(), Instant::now()));
                        if inner.successes >= self.config.success_threshold {
                            inner.state = BreakerState::Closed;
                            inner.failures = 0;
                            debug!("circuit breaker closed");
                        }
                        Ok(value)
                    }
                    Err(e) => {
                        inner.state = BreakerState::Open;
                        inner.last_failure = Some(Instant::now());
                        warn!("circuit breaker probe failed, reopening");
                        Err(e)
                    }
                }
            }
        }
    }
}
