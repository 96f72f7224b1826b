use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Buckets refill their full capacity over this window.
pub const REFILL_WINDOW: Duration = Duration::from_secs(60);

/// Monotonic time source for the limiter.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-client token bucket limiter with continuous refill.
///
/// Every client identity gets its own bucket holding up to `capacity` tokens,
/// refilled at `capacity` tokens per [`REFILL_WINDOW`]. Each admitted request
/// spends one token. The whole table sits behind one lock that is held for the
/// entire refill-and-spend step, so two concurrent checks for the same client
/// can never both spend the same token.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    capacity: f64,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self::with_clock(requests_per_minute, Arc::new(SystemClock))
    }

    pub fn with_clock(requests_per_minute: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            capacity: f64::from(requests_per_minute),
            clock,
        }
    }

    /// Tries to spend one token for `identity`. Returns `true` if the request is admitted.
    ///
    /// An unseen identity starts with a full bucket. A rejection leaves the
    /// fractional balance in place.
    pub async fn admit(&self, identity: &str) -> bool {
        let now = self.clock.now();
        let capacity = self.capacity;
        let mut buckets = self.buckets.lock().await;

        let bucket = buckets
            .entry(identity.to_owned())
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let refill = elapsed.as_secs_f64() / REFILL_WINDOW.as_secs_f64() * capacity;
        bucket.tokens = (bucket.tokens + refill).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets that have been idle for at least one refill window.
    ///
    /// Such a bucket would be back at full capacity on its next check, which is
    /// exactly the state a freshly created bucket starts in.
    pub async fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            now.saturating_duration_since(bucket.last_refill) < REFILL_WINDOW
        });
        before - buckets.len()
    }

    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.lock().await.is_empty()
    }

    #[cfg(test)]
    async fn tokens(&self, identity: &str) -> Option<f64> {
        self.buckets
            .lock()
            .await
            .get(identity)
            .map(|bucket| bucket.tokens)
    }
}
