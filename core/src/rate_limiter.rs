//! Token bucket throttling concurrent VM launches. Launching VMs too
//! quickly destabilizes the page-merging daemon, so the supervisor waits
//! for a token at the head of every launch.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

struct Bucket {
    rate: Duration,
    burst: u32,
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket rate limiter. `wait()` blocks until a token is
/// available; `set_rate`/`set_burst` update parameters live and amortize
/// the currently-held count rather than resetting it.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `rate` is the time between tokens at steady state; `burst` is the
    /// maximum number of tokens that can accumulate.
    pub fn new(rate: Duration, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                rate,
                burst,
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn wait(&self) {
        loop {
            let sleep_for = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    Some(bucket.rate.mul_f64(deficit))
                }
            };
            match sleep_for {
                None => return,
                Some(duration) => sleep(duration).await,
            }
        }
    }

    pub async fn set_rate(&self, rate: Duration) {
        let mut bucket = self.bucket.lock().await;
        bucket.refill();
        bucket.rate = rate;
    }

    pub async fn set_burst(&self, burst: u32) {
        let mut bucket = self.bucket.lock().await;
        bucket.refill();
        bucket.burst = burst;
        bucket.tokens = bucket.tokens.min(burst as f64);
    }

    /// Current token count, for tests and diagnostics - never exceeds the
    /// configured burst size.
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill();
        bucket.tokens
    }
}

impl Bucket {
    fn refill(&mut self) {
        if self.rate.is_zero() {
            self.tokens = self.burst as f64;
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let accrued = elapsed.as_secs_f64() / self.rate.as_secs_f64();
        self.tokens = (self.tokens + accrued).min(self.burst as f64);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_allows_immediate_launches() {
        let limiter = RateLimiter::new(Duration::from_millis(50), 3);
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_millis(10), limiter.wait())
                .await
                .expect("burst token should be immediately available");
        }
    }

    #[tokio::test]
    async fn test_exhausted_bucket_blocks_until_refill() {
        let limiter = RateLimiter::new(Duration::from_millis(20), 1);
        limiter.wait().await;
        let start = Instant::now();
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_never_exceeds_burst_size() {
        let limiter = RateLimiter::new(Duration::from_millis(1), 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.available_tokens().await <= 2.0);
    }

    #[tokio::test]
    async fn test_set_burst_caps_held_tokens() {
        let limiter = RateLimiter::new(Duration::from_millis(1), 10);
        tokio::time::sleep(Duration::from_millis(5)).await;
        limiter.set_burst(2).await;
        assert!(limiter.available_tokens().await <= 2.0);
    }
}
