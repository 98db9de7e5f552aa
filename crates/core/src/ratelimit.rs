//! Per-client token-bucket admission for the API surface.

use crate::error::{CoreError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::debug;

const EVICTION_TICK: Duration = Duration::from_secs(60);
const IDLE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_check: Instant,
}

/// Token bucket per client identity (typically the remote IP). Buckets
/// refill continuously at `rps` up to `burst`; clients idle for more than
/// five minutes are evicted by a background ticker.
pub struct RateLimiter {
    rps: f64,
    burst: f64,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    stopped: Arc<AtomicBool>,
    ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(rps: f64, burst: f64) -> Arc<Self> {
        let limiter = Arc::new(Self {
            rps,
            burst,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            ticker: Mutex::new(None),
        });

        let buckets = limiter.buckets.clone();
        let stopped = limiter.stopped.clone();
        let handle = tokio::spawn(async move {
            let mut tick = interval(EVICTION_TICK);
            loop {
                tick.tick().await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let mut buckets = buckets.lock().unwrap_or_else(|e| e.into_inner());
                let before = buckets.len();
                buckets.retain(|_, b| b.last_check.elapsed() < IDLE_TTL);
                let evicted = before - buckets.len();
                if evicted > 0 {
                    debug!("rate limiter evicted {} idle clients", evicted);
                }
            }
        });
        *limiter.ticker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        limiter
    }

    /// Admit or reject one request from `client`.
    pub fn check(&self, client: &str) -> Result<()> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(client.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_check: now,
        });

        let elapsed = now.duration_since(bucket.last_check).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst);
        bucket.last_check = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(CoreError::RateLimited)
        }
    }

    pub fn client_count(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Idempotent; stops the eviction ticker.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_admits_then_rejects() {
        let limiter = RateLimiter::new(1.0, 3.0);
        for _ in 0..3 {
            limiter.check("10.0.0.1").unwrap();
        }
        assert!(matches!(
            limiter.check("10.0.0.1"),
            Err(CoreError::RateLimited)
        ));
        limiter.stop();
    }

    #[tokio::test]
    async fn refill_restores_admission() {
        let limiter = RateLimiter::new(20.0, 1.0);
        limiter.check("c").unwrap();
        assert!(limiter.check("c").is_err());
        tokio::time::sleep(Duration::from_millis(120)).await;
        limiter.check("c").unwrap();
        limiter.stop();
    }

    #[tokio::test]
    async fn clients_are_isolated() {
        let limiter = RateLimiter::new(0.1, 1.0);
        limiter.check("a").unwrap();
        assert!(limiter.check("a").is_err());
        // A different client still has its burst.
        limiter.check("b").unwrap();
        assert_eq!(limiter.client_count(), 2);
        limiter.stop();
    }

    #[tokio::test]
    async fn refill_caps_at_burst() {
        let limiter = RateLimiter::new(10.0, 2.0);
        limiter.check("c").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        // Even after plenty of refill time only `burst` tokens exist.
        limiter.check("c").unwrap();
        limiter.check("c").unwrap();
        assert!(limiter.check("c").is_err());
        limiter.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let limiter = RateLimiter::new(1.0, 1.0);
        limiter.stop();
        limiter.stop();
    }
}
