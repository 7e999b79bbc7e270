// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry backoff, rate limiting, bulkheads.
//!
//! - [`RetryPolicy`]: exponential backoff and the dead-letter ceiling for
//!   failed change records
//! - [`RateLimiter`]: token bucket in front of background applier calls
//! - [`Bulkhead`]: semaphore capping concurrent sync requests
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use offline_sync_engine::resilience::{Bulkhead, RateLimitConfig, RateLimiter, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(3600), 5);
//! assert_eq!(policy.delay_for(2), Duration::from_secs(240));
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! let bulkhead = Bulkhead::new(10);
//! if let Some(_permit) = bulkhead.try_acquire() {
//!     // permit dropped = slot released
//! }
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// =============================================================================
// Retry Policy
// =============================================================================

/// Backoff schedule and retry ceiling for failed change records.
///
/// ```text
/// retry_count  delay (base = 1m, cap = 1h)
/// -----------  -----
/// 0            1m
/// 1            2m
/// 2            4m
/// 3            8m
/// ...
/// 6+           1h
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay unit: the first retry waits this long.
    pub base_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Failures after which a record is dead-lettered.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// `base * 2^retry_count`, capped at `max_delay`.
    ///
    /// `retry_count` is the count *before* the failure being scheduled.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Raise `max_delay` to at least `delay_for(max_attempts - 1)`, so the
    /// ceiling only flattens delays past the last scheduled retry.
    pub fn uncapped_before_exhaustion(mut self) -> Self {
        let last = self.base_delay
            .checked_mul(1u32.checked_shl(self.max_attempts.saturating_sub(1)).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX);
        self.max_delay = self.max_delay.max(last);
        self
    }

    /// Whether a record that has now failed `retry_count` times should stop
    /// retrying.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each operation consumes one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 ops/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
///
/// Thread-safe and async-aware.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota =
            Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
                .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
        }
    }

    /// Acquire a permit, blocking until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Bulkhead pattern: limits concurrent operations to prevent resource exhaustion.
///
/// The coordinator uses it fail-fast: a request that cannot get a slot is
/// rejected as overloaded rather than queued.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Try to acquire a permit without waiting.
    ///
    /// Returns `None` if the bulkhead is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Number of permits currently held.
    pub fn in_use(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Get the maximum concurrent operations allowed.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 10);

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30)); // capped
    }

    #[test]
    fn test_delay_saturates_on_huge_counts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(40), policy.max_delay);
        assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    }

    #[test]
    fn test_exhaustion() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }

    #[test]
    fn test_cap_lifted_until_exhaustion() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_millis(100), 5)
            .uncapped_before_exhaustion();
        assert_eq!(policy.max_delay, Duration::from_secs(16));
        for retry in 0..4 {
            assert!(policy.delay_for(retry) < policy.delay_for(retry + 1));
        }
        assert_eq!(policy.delay_for(10), Duration::from_secs(16));

        // a cap already above the schedule is kept
        let policy = RetryPolicy::default().uncapped_before_exhaustion();
        assert_eq!(policy.max_delay, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_rate_limiter_zero_values_clamp() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        tokio::time::timeout(Duration::from_millis(500), limiter.acquire())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..10 {
            limiter.acquire().await;
        }
    }

    #[test]
    fn test_bulkhead_try_acquire() {
        let bulkhead = Bulkhead::new(2);

        let p1 = bulkhead.try_acquire();
        let p2 = bulkhead.try_acquire();
        assert!(p1.is_some());
        assert!(p2.is_some());
        assert_eq!(bulkhead.in_use(), 2);
        assert!(bulkhead.try_acquire().is_none());

        drop(p1);
        assert_eq!(bulkhead.in_use(), 1);
        assert!(bulkhead.try_acquire().is_some());
        assert_eq!(bulkhead.max_concurrent(), 2);
    }
}
