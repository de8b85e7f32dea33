//! Outbound rate limiting using Token Bucket algorithm

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Scaled units per token
const SCALE: u64 = 1000;

/// Rate limiter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Sustained requests per second
    pub requests_per_second: u32,
    /// Burst capacity (max tokens)
    pub burst_size: u32,
}

impl RateLimitConfig {
    pub fn new(requests_per_second: u32, burst_size: u32) -> Self {
        Self {
            requests_per_second,
            burst_size,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100,
            burst_size: 100,
        }
    }
}

/// Token bucket rate limiter
///
/// Starts full at `burst_size` tokens. Tokens refill lazily at check time,
/// `elapsed * requests_per_second`, and never exceed `burst_size`.
#[derive(Debug)]
pub struct RateLimiter {
    /// Current tokens (scaled by 1000 for precision)
    tokens: AtomicU64,
    last_refill: Mutex<Instant>,
    config: RateLimitConfig,
    /// Max tokens (scaled)
    max_tokens: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let max_tokens = config.burst_size as u64 * SCALE;
        Self {
            tokens: AtomicU64::new(max_tokens),
            last_refill: Mutex::new(Instant::now()),
            config,
            max_tokens,
        }
    }

    /// Consume one token. Returns false, consuming nothing, when fewer than
    /// one token is available.
    pub fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            if current < SCALE {
                return false;
            }

            match self.tokens.compare_exchange_weak(
                current,
                current - SCALE,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let elapsed_ms = last.elapsed().as_millis() as u64;
        if elapsed_ms == 0 {
            return;
        }

        // requests_per_second tokens per second == requests_per_second scaled units per ms
        let new_tokens = self.config.requests_per_second as u64 * elapsed_ms;
        *last += Duration::from_millis(elapsed_ms);

        let _ = self
            .tokens
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |current| {
                Some((current + new_tokens).min(self.max_tokens))
            });
    }

    /// Whole tokens currently available
    pub fn available_tokens(&self) -> u32 {
        self.refill();
        (self.tokens.load(Ordering::Relaxed) / SCALE) as u32
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_basic_rate_limiting() {
        let limiter = RateLimiter::new(RateLimitConfig::new(10, 5));

        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }

        assert!(!limiter.try_acquire());
        assert_eq!(limiter.available_tokens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_refill() {
        let limiter = RateLimiter::new(RateLimitConfig::new(100, 10));

        for _ in 0..10 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());

        // 100/s refills one token every 10ms
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_burst() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1000, 3));
        limiter.try_acquire();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available_tokens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_refill_accumulates() {
        let limiter = RateLimiter::new(RateLimitConfig::new(100, 1));
        assert!(limiter.try_acquire());

        // Four 3ms steps cross the 10ms boundary once
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(3)).await;
            assert!(!limiter.try_acquire());
        }
        tokio::time::advance(Duration::from_millis(3)).await;
        assert!(limiter.try_acquire());
    }
}
