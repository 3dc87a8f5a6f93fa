//! Outbound message throttle
//!
//! Token bucket holding at most `permits` tokens, refilled continuously at
//! `permits / window`. Waiters are served in lock order, so every caller
//! eventually proceeds and nothing is dropped.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Float slack absorbed when comparing refilled tokens against a whole permit
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter shared by every outbound send on a channel
#[derive(Debug)]
pub struct RateLimiter {
    permits: u32,
    window: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Allow `permits` sends per `window`, starting with a full bucket
    pub fn new(permits: u32, window: Duration) -> Self {
        let permits = permits.max(1);
        Self {
            permits,
            window,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(permits),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn per_second(permits: u32) -> Self {
        Self::new(permits, Duration::from_secs(1))
    }

    pub fn permits(&self) -> u32 {
        self.permits
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        bucket.last_refill = now;

        if self.window.is_zero() {
            bucket.tokens = f64::from(self.permits);
            return;
        }

        let earned = elapsed.as_secs_f64() * f64::from(self.permits) / self.window.as_secs_f64();
        bucket.tokens = (bucket.tokens + earned).min(f64::from(self.permits));
    }

    fn deficit_wait(&self, bucket: &Bucket) -> Duration {
        let missing = (1.0 - bucket.tokens).max(0.0);
        Duration::from_secs_f64(missing * self.window.as_secs_f64() / f64::from(self.permits))
    }

    /// Wait until a permit is available and consume it
    pub async fn wait_to_proceed(&self) {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);

        while bucket.tokens + TOKEN_EPSILON < 1.0 {
            let wait = self.deficit_wait(&bucket);
            sleep(wait).await;
            self.refill(&mut bucket);
        }

        bucket.tokens = (bucket.tokens - 1.0).max(0.0);
    }

    /// Consume a permit if one is available right now
    pub fn try_acquire(&self) -> bool {
        let Ok(mut bucket) = self.bucket.try_lock() else {
            return false;
        };
        self.refill(&mut bucket);

        if bucket.tokens + TOKEN_EPSILON >= 1.0 {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Time until the next permit frees up (zero if one is available)
    pub async fn wait_time(&self) -> Duration {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens + TOKEN_EPSILON >= 1.0 {
            Duration::ZERO
        } else {
            self.deficit_wait(&bucket)
        }
    }
}
