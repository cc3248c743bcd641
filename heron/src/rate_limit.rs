use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::RateLimitConfig;

/// A simple token-bucket instance shared by every slot of a worker.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    inner: Arc<Mutex<TokenBucketInner>>,
}

#[derive(Debug)]
struct TokenBucketInner {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_check: Instant,
}

impl TokenBucketInner {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_check).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_check = now;
        }
    }
}

impl TokenBucket {
    pub fn new(capacity: usize, refill_per_sec: f64) -> Self {
        let inner = TokenBucketInner {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_check: Instant::now(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// At most `max` acquisitions per `duration_ms`, bursting up to `max`.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let window = Duration::from_millis(config.duration_ms.max(1)).as_secs_f64();
        Self::new(config.max.max(1) as usize, f64::from(config.max.max(1)) / window)
    }

    pub async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.refill();
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                inner.refill();
                if inner.tokens >= 1.0 {
                    inner.tokens -= 1.0;
                    return;
                }
                let missing = 1.0 - inner.tokens;
                Duration::from_secs_f64(missing / inner.refill_per_sec.max(f64::EPSILON))
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Return a token taken by a pull that found nothing to do.
    pub async fn refund(&self) {
        let mut inner = self.inner.lock().await;
        inner.tokens = (inner.tokens + 1.0).min(inner.capacity);
    }
}
