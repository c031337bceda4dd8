//! Shared inbound rate limiting.
//!
//! All inbound relay traffic of a node drains one token bucket. Readers wait
//! for tokens instead of dropping frames, which pushes back on the link.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket state
#[derive(Debug)]
struct TokenBucket {
    /// Current number of tokens (bytes)
    tokens: f64,

    /// Maximum tokens (one second of traffic)
    max_tokens: f64,

    /// Tokens added per second
    rate: f64,

    /// Last refill time
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64) -> Self {
        Self {
            tokens: rate,
            max_tokens: rate,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + self.rate * elapsed.as_secs_f64()).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Consume `amount`, or report how long until enough tokens accrue
    ///
    /// A frame larger than the bucket is admitted once the bucket is full and
    /// leaves it in debt.
    fn try_consume(&mut self, amount: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        let needed = amount.min(self.max_tokens);
        if self.tokens >= needed {
            self.tokens -= amount;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((needed - self.tokens) / self.rate))
        }
    }
}

/// Byte-rate limiter shared by all inbound relay connections
#[derive(Debug)]
pub struct InboundLimiter {
    bucket: Mutex<TokenBucket>,
}

impl InboundLimiter {
    /// Create a limiter admitting `bytes_per_second`
    #[must_use]
    pub fn new(bytes_per_second: u64) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let rate = bytes_per_second.max(1) as f64;
        Self {
            bucket: Mutex::new(TokenBucket::new(rate)),
        }
    }

    /// Wait until `bytes` may be admitted
    pub async fn acquire(&self, bytes: usize) {
        #[allow(clippy::cast_precision_loss)]
        let amount = bytes as f64;
        loop {
            let wait = self.bucket.lock().try_consume(amount, Instant::now());
            match wait {
                Ok(()) => return,
                Err(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Admit `bytes` now if tokens are available
    #[cfg(test)]
    fn try_acquire(&self, bytes: usize) -> bool {
        #[allow(clippy::cast_precision_loss)]
        let amount = bytes as f64;
        self.bucket.lock().try_consume(amount, Instant::now()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle() {
        let limiter = InboundLimiter::new(1000);
        assert!(limiter.try_acquire(600));
        assert!(limiter.try_acquire(400));
        assert!(!limiter.try_acquire(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = InboundLimiter::new(1000);
        limiter.acquire(1000).await;

        let start = Instant::now();
        limiter.acquire(500).await;
        let waited = start.elapsed();

        assert!(waited >= Duration::from_millis(490));
        assert!(waited < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_frame_admitted_when_full() {
        let limiter = InboundLimiter::new(100);
        limiter.acquire(1000).await;
        assert!(!limiter.try_acquire(1));
    }
}
