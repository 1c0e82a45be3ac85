use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bazaar_shared::PeerId;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Token bucket: `capacity` tokens, refilled at `rate` tokens per second.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        self.try_consume_at(Instant::now(), rate, capacity)
    }

    /// Refill for the time elapsed up to `now`, then take one token if there
    /// is one. Never waits.
    pub fn try_consume_at(&mut self, now: Instant, rate: f64, capacity: f64) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// One bucket per remote peer.
#[derive(Clone)]
pub struct PeerRateLimiter {
    buckets: Arc<Mutex<HashMap<PeerId, TokenBucket>>>,
    rate: f64,
    capacity: f64,
}

impl PeerRateLimiter {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    /// Admit or deny one operation for `peer` right now.
    pub async fn check(&self, peer: &PeerId) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(peer.clone())
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_consume(self.rate, self.capacity)
    }

    /// Wait until `peer` is admitted. A denied caller sleeps one refill
    /// interval and asks again; nothing queues inside the limiter.
    pub async fn acquire(&self, peer: &PeerId) {
        let backoff = self.refill_interval();
        while !self.check(peer).await {
            debug!(peer = %peer.short(), wait_ms = backoff.as_millis() as u64, "rate limited");
            tokio::time::sleep(backoff).await;
        }
    }

    fn refill_interval(&self) -> Duration {
        if self.rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.rate)
        } else {
            Duration::from_secs(1)
        }
    }

    /// Drop buckets that have not been touched for `max_idle`.
    pub async fn purge_stale(&self, max_idle: Duration) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < max_idle);
    }
}

impl Default for PeerRateLimiter {
    fn default() -> Self {
        Self::new(20.0, 50.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_one_token_per_second() {
        let mut bucket = TokenBucket::new(5.0);
        for _ in 0..5 {
            assert!(bucket.try_consume(1.0, 5.0));
        }
        assert!(!bucket.try_consume(1.0, 5.0));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(bucket.try_consume(1.0, 5.0));
        assert!(!bucket.try_consume(1.0, 5.0));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(2.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.try_consume(1.0, 2.0));
        assert!(bucket.try_consume(1.0, 2.0));
        assert!(!bucket.try_consume(1.0, 2.0));
    }

    #[tokio::test]
    async fn sub_millisecond_refills_accumulate() {
        let start = Instant::now();
        let mut bucket = TokenBucket {
            tokens: 0.0,
            last_refill: start,
        };
        let mut admitted = 0;
        for step in 1..=10u64 {
            let now = start + Duration::from_micros(500 * step);
            if bucket.try_consume_at(now, 1000.0, 10.0) {
                admitted += 1;
            }
        }
        assert!(admitted >= 4, "admitted {admitted}");
    }

    #[tokio::test]
    async fn peers_have_separate_buckets() {
        let limiter = PeerRateLimiter::new(10.0, 2.0);
        let a = PeerId::new("laptop");
        let b = PeerId::new("phone");

        assert!(limiter.check(&a).await);
        assert!(limiter.check(&a).await);
        assert!(!limiter.check(&a).await);

        assert!(limiter.check(&b).await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let limiter = PeerRateLimiter::new(2.0, 1.0);
        let peer = PeerId::new("tablet");
        let start = Instant::now();

        limiter.acquire(&peer).await;
        limiter.acquire(&peer).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn purge_stale() {
        let limiter = PeerRateLimiter::new(10.0, 5.0);
        assert!(limiter.check(&PeerId::new("old")).await);

        limiter.purge_stale(Duration::ZERO).await;

        let buckets = limiter.buckets.lock().await;
        assert!(buckets.is_empty());
    }
}
