//! Outbound request pacing for confsync.
//!
//! This module provides the token-bucket gate placed in front of every
//! outbound request class (config fetch, long poll). Unlike a server-side
//! limiter it never rejects work outright: callers ask for a token with a
//! bounded wait and decide themselves what to do on timeout.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use confsync_common::rate_limit::{RateLimitConfig, RateLimiter};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let limiter = RateLimiter::new(RateLimitConfig::per_second(2.0));
//! if !limiter.try_acquire(Duration::from_secs(5)).await {
//!     // proceed anyway after an additional fixed sleep; never drop the work
//! }
//! # });
//! ```

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Configuration for a token-bucket gate.
///
/// `permits_per_second` is the sustained rate; `burst_size` bounds how many
/// permits can accumulate while the gate is idle.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Maximum sustained request rate (requests per second)
    pub permits_per_second: f64,
    /// Maximum burst size (number of tokens)
    pub burst_size: u32,
}

impl RateLimitConfig {
    pub fn new(permits_per_second: f64, burst_size: u32) -> Self {
        Self {
            permits_per_second,
            burst_size,
        }
    }

    /// Creates a configuration for a sustained per-second rate with a burst
    /// of one second's worth of permits (minimum 1).
    pub fn per_second(rate: f64) -> Self {
        let burst_size = rate.ceil().max(1.0) as u32;
        Self::new(rate, burst_size)
    }
}

/// Token bucket state.
#[derive(Debug)]
struct TokenBucket {
    /// Current number of available tokens
    tokens: f64,
    /// Last time this bucket was refilled
    last_update: Instant,
}

impl TokenBucket {
    fn new(burst_size: u32) -> Self {
        Self {
            tokens: burst_size as f64,
            last_update: Instant::now(),
        }
    }

    /// Refills based on elapsed time, then attempts to consume one token.
    fn try_consume(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        let elapsed_secs = now.duration_since(self.last_update).as_secs_f64();
        let refill = elapsed_secs * config.permits_per_second;
        self.tokens = (self.tokens + refill).min(config.burst_size as f64);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one full token will be available.
    fn time_until_next_token(&self, config: &RateLimitConfig) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let needed = 1.0 - self.tokens;
            Duration::from_secs_f64(needed / config.permits_per_second)
        }
    }
}

/// Token-bucket gate for one outbound request class.
///
/// Shared across tasks behind an `Arc`; acquisition is serialized on an async
/// mutex so waiters sleep instead of spinning.
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let bucket = Mutex::new(TokenBucket::new(config.burst_size));
        Self { config, bucket }
    }

    /// Waits up to `timeout` for one token.
    ///
    /// Returns `true` once a token was consumed, `false` if the timeout
    /// would elapse first. On `false` the caller is expected to proceed
    /// anyway after its own fixed sleep: the gate paces requests, it does
    /// not drop them.
    pub async fn try_acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_consume(&self.config, now) {
                    return true;
                }
                bucket.time_until_next_token(&self.config)
            };

            if now + wait > deadline {
                return false;
            }
            tokio::time::sleep(wait).await;
        }
    }
}
