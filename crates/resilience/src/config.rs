//! Aggregate configuration for the resilience engine
//!
//! [`ResilienceConfig`] bundles the per-component configs. It is a plain
//! value: callers load and merge it however they like, then hand the
//! finished value to [`ResilienceManager::new`](crate::ResilienceManager::new),
//! which validates it once and never mutates it.
//!
//! Every struct deserializes with missing fields filled from `Default`, and
//! durations travel as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::health::HealthCheckConfig;
use crate::metrics::MetricsConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryConfig;

/// Serde helpers for `Duration` as integer milliseconds.
///
/// ```rust
/// use std::time::Duration;
///
/// use agui_resilience::config::duration_millis;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Example {
///     #[serde(with = "duration_millis")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as milliseconds, saturating at `u64::MAX`.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Deadlines applied to each attempt and forwarded to the transport.
///
/// Only `operation_timeout` is enforced here; the connection-level values
/// are carried for the HTTP/SSE transport that shares this config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for a single attempt of the wrapped operation.
    #[serde(with = "duration_millis")]
    pub operation_timeout: Duration,
    /// Connection establishment timeout.
    #[serde(with = "duration_millis")]
    pub connection_timeout: Duration,
    /// Socket read timeout.
    #[serde(with = "duration_millis")]
    pub read_timeout: Duration,
    /// Socket write timeout.
    #[serde(with = "duration_millis")]
    pub write_timeout: Duration,
    /// TCP keep-alive interval.
    #[serde(with = "duration_millis")]
    pub keep_alive_timeout: Duration,
    /// Idle pooled connection lifetime.
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl TimeoutConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::invalid("operation_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Complete configuration for a [`ResilienceManager`](crate::ResilienceManager).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Retry loop settings.
    pub retry: RetryConfig,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Token bucket settings.
    pub rate_limit: RateLimitConfig,
    /// Deadlines.
    pub timeout: TimeoutConfig,
    /// Concurrency isolation settings.
    pub bulkhead: BulkheadConfig,
    /// Background health probing settings.
    pub health_check: HealthCheckConfig,
    /// Outcome counters and histogram settings.
    pub metrics: MetricsConfig,
}

impl ResilienceConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::new()
    }

    /// Validate every sub-config.
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()?;
        self.timeout.validate()?;
        self.bulkhead.validate()?;
        self.health_check.validate()?;
        self.metrics.validate()?;
        Ok(())
    }

    /// Local development: slow fixed retries, no breaker, no rate limiting.
    pub fn development() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                backoff_multiplier: 2.0,
                jitter_enabled: false,
                jitter_max_factor: 0.1,
                retryable_errors: vec!["timeout".to_string(), "connection_error".to_string()],
            },
            circuit_breaker: CircuitBreakerConfig { enabled: false, ..Default::default() },
            rate_limit: RateLimitConfig { enabled: false, burst_size: 20, ..Default::default() },
            ..Self::default()
        }
    }

    /// Production: more retries with wider jitter and a tolerant breaker.
    pub fn production() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                backoff_multiplier: 2.0,
                jitter_enabled: true,
                jitter_max_factor: 0.2,
                retryable_errors: [
                    "timeout",
                    "connection_error",
                    "service_unavailable",
                    "rate_limit",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
            },
            circuit_breaker: CircuitBreakerConfig {
                enabled: true,
                failure_threshold: 20,
                success_threshold: 5,
                timeout: Duration::from_secs(60),
                half_open_max_calls: 10,
                failure_rate_threshold: 0.5,
                minimum_request_threshold: 50,
            },
            rate_limit: RateLimitConfig { enabled: true, requests_per_second: 100, burst_size: 20 },
            ..Self::default()
        }
    }

    /// Everything off: one attempt, no admission control, no background
    /// probing.
    pub fn minimal() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 0,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                backoff_multiplier: 1.0,
                jitter_enabled: false,
                jitter_max_factor: 0.0,
                retryable_errors: Vec::new(),
            },
            circuit_breaker: CircuitBreakerConfig { enabled: false, ..Default::default() },
            rate_limit: RateLimitConfig { enabled: false, ..Default::default() },
            bulkhead: BulkheadConfig { enabled: false, ..Default::default() },
            health_check: HealthCheckConfig { enabled: false, ..Default::default() },
            metrics: MetricsConfig { enable_detailed_metrics: false, ..Default::default() },
            ..Self::default()
        }
    }
}

/// Builder for [`ResilienceConfig`].
#[derive(Debug, Default)]
pub struct ResilienceConfigBuilder {
    config: ResilienceConfig,
}

impl ResilienceConfigBuilder {
    /// Builder seeded with [`ResilienceConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded with an existing config, e.g. a profile.
    pub fn from_config(config: ResilienceConfig) -> Self {
        Self { config }
    }

    /// Replace the retry settings.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Replace the circuit breaker settings.
    #[must_use]
    pub fn circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = circuit_breaker;
        self
    }

    /// Replace the rate limit settings.
    #[must_use]
    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    /// Replace the timeout settings.
    #[must_use]
    pub fn timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Shortcut for the per-attempt deadline.
    #[must_use]
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout.operation_timeout = timeout;
        self
    }

    /// Replace the bulkhead settings.
    #[must_use]
    pub fn bulkhead(mut self, bulkhead: BulkheadConfig) -> Self {
        self.config.bulkhead = bulkhead;
        self
    }

    /// Replace the health check settings.
    #[must_use]
    pub fn health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.config.health_check = health_check;
        self
    }

    /// Replace the metrics settings.
    #[must_use]
    pub fn metrics(mut self, metrics: MetricsConfig) -> Self {
        self.config.metrics = metrics;
        self
    }

    /// Validate and return the config.
    pub fn build(self) -> ConfigResult<ResilienceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
