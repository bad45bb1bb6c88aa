//! Token-bucket rate limiter with lazy per-second refill
//!
//! The bucket starts full at `burst_size`. There is no background timer:
//! every [`RateLimiter::allow`] call first tops the bucket up by
//! `whole_seconds_elapsed * requests_per_second` (capped at `burst_size`),
//! then spends one token if it can.
//!
//! Refill granularity is a whole second. Fractions of a second since the last
//! refill are dropped when a refill happens, so sustained throughput can fall
//! slightly below the configured rate. That coarseness is accepted.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};

/// Rate limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// When false every call is allowed.
    pub enabled: bool,
    /// Tokens added per whole elapsed second.
    pub requests_per_second: u64,
    /// Bucket capacity.
    pub burst_size: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { enabled: true, requests_per_second: 100, burst_size: 10 }
    }
}

impl RateLimitConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.requests_per_second == 0 {
            return Err(ConfigError::invalid("requests_per_second must be greater than 0"));
        }
        if self.burst_size == 0 {
            return Err(ConfigError::invalid("burst_size must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket admission gate.
pub struct RateLimiter<C: Clock = SystemClock> {
    config: RateLimitConfig,
    bucket: Arc<Mutex<Bucket>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<C: Clock> Clone for RateLimiter<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            bucket: Arc::clone(&self.bucket),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl RateLimiter<SystemClock> {
    /// Limiter on the system clock.
    pub fn new(config: RateLimitConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Limiter reading time from `clock`.
    pub fn with_clock(config: RateLimitConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        let bucket = Bucket { tokens: config.burst_size, last_refill: clock.now() };
        Ok(Self { config, bucket: Arc::new(Mutex::new(bucket)), clock: Arc::new(clock) })
    }

    /// The limiter's configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn refilled(&self) -> MutexGuard<'_, Bucket> {
        let now = self.clock.now();
        let mut bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Rate limiter bucket lock poisoned, recovering");
                poisoned.into_inner()
            }
        };

        let whole_seconds = now.saturating_duration_since(bucket.last_refill).as_secs();
        if whole_seconds > 0 {
            let added = whole_seconds.saturating_mul(self.config.requests_per_second);
            bucket.tokens = bucket.tokens.saturating_add(added).min(self.config.burst_size);
            bucket.last_refill = now;
        }
        bucket
    }

    /// Spend one token if available.
    pub fn allow(&self) -> bool {
        if !self.config.enabled {
            return true;
        }

        let mut bucket = self.refilled();
        if bucket.tokens == 0 {
            debug!("Rate limit exceeded, no tokens left");
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    /// Tokens currently available after applying any due refill.
    ///
    /// A disabled limiter reports its burst size.
    pub fn available_tokens(&self) -> u64 {
        if !self.config.enabled {
            return self.config.burst_size;
        }
        self.refilled().tokens
    }
}
