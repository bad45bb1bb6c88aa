//! Retry loop with exponential backoff and additive jitter
//!
//! Attempt `0` runs immediately. Attempt `n >= 1` first waits
//!
//! ```text
//! delay(n) = min(base_delay * backoff_multiplier^(n - 1), max_delay)
//!          + uniform(0, 1) * jitter_max_factor * that value   (when jitter is on)
//! ```
//!
//! so jitter only ever lengthens a wait. `max_attempts` counts retries: a
//! call makes at most `max_attempts + 1` attempts.
//!
//! After each failure the error is classified. Non-retryable errors are
//! returned as they are; a retryable failure on the final attempt is wrapped
//! in [`ResilienceError::RetryExhausted`]. Backoff sleeps race the caller's
//! cancellation token and return [`ResilienceError::Cancelled`] as soon as it
//! fires.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::duration_millis;
use crate::error::{
    ConfigError, ConfigResult, ErrorClassification, ResilienceError, ResilienceResult,
};

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_attempts: u32,
    /// Wait before the first retry.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound for the un-jittered wait.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
    /// Add random jitter on top of each wait.
    pub jitter_enabled: bool,
    /// Largest jitter as a fraction of the wait.
    pub jitter_max_factor: f64,
    /// Error messages that are retryable regardless of classification.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_max_factor: 0.1,
            retryable_errors: ["timeout", "connection refused", "temporary failure"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Doubling backoff capped at sixteen times `base_delay`.
    pub fn quick(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: base_delay.saturating_mul(16),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_max_factor: 0.1,
            retryable_errors: ["timeout", "connection_error", "service_unavailable"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("backoff_multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_max_factor) {
            return Err(ConfigError::invalid("jitter_max_factor must be within [0, 1]"));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid("base_delay cannot exceed max_delay"));
        }
        Ok(())
    }
}

/// Builder for [`RetryConfig`].
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Builder seeded with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries after the first attempt.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Exponential backoff parameters.
    #[must_use]
    pub fn exponential_backoff(
        mut self,
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        self.config.base_delay = base_delay;
        self.config.backoff_multiplier = multiplier;
        self.config.max_delay = max_delay;
        self
    }

    /// Enable jitter up to `max_factor` of each wait.
    #[must_use]
    pub fn jitter(mut self, max_factor: f64) -> Self {
        self.config.jitter_enabled = true;
        self.config.jitter_max_factor = max_factor;
        self
    }

    /// Disable jitter.
    #[must_use]
    pub fn no_jitter(mut self) -> Self {
        self.config.jitter_enabled = false;
        self
    }

    /// Replace the retryable message list.
    #[must_use]
    pub fn retryable_errors<I, S>(mut self, messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.retryable_errors = messages.into_iter().map(Into::into).collect();
        self
    }

    /// Validate and return the config.
    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Runs operations under the retry policy.
///
/// Holds no per-call state; one manager serves any number of concurrent
/// callers. The jitter source is private to the manager.
#[derive(Debug)]
pub struct RetryManager {
    config: RetryConfig,
    rng: Mutex<StdRng>,
}

impl RetryManager {
    /// Manager with an entropy-seeded jitter source.
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, rng: Mutex::new(StdRng::from_entropy()) })
    }

    /// Manager with a fixed jitter seed, for reproducible delays.
    pub fn with_seed(config: RetryConfig, seed: u64) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, rng: Mutex::new(StdRng::seed_from_u64(seed)) })
    }

    /// The retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Un-jittered wait before `attempt`. Zero for attempt 0.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let scaled = self.config.base_delay.as_nanos() as f64
            * self.config.backoff_multiplier.powi(exponent);
        let max_nanos = self.config.max_delay.as_nanos() as f64;
        if scaled >= max_nanos {
            return self.config.max_delay;
        }
        Duration::from_nanos(scaled.round() as u64)
    }

    /// Wait before `attempt` including jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if !self.config.jitter_enabled || delay.is_zero() {
            return delay;
        }
        let sample: f64 = self.rng.lock().unwrap_or_else(PoisonError::into_inner).gen();
        delay + delay.mul_f64(sample * self.config.jitter_max_factor)
    }

    /// Whether a failed attempt should be retried.
    ///
    /// Operation errors qualify when they classify as retryable or when
    /// their message exactly equals a configured retryable message. A
    /// per-attempt timeout always qualifies; cancellation never does.
    pub fn is_retryable<E>(&self, error: &ResilienceError<E>) -> bool
    where
        E: ErrorClassification + std::error::Error + Send + Sync + 'static,
    {
        match error {
            ResilienceError::Operation(inner) => {
                inner.is_retryable() || self.matches_retryable_message(&inner.to_string())
            }
            ResilienceError::OperationTimeout { .. } => true,
            _ => false,
        }
    }

    fn matches_retryable_message(&self, message: &str) -> bool {
        self.config.retryable_errors.iter().any(|candidate| candidate == message)
    }

    /// Run `operation` until it succeeds, fails permanently or runs out of
    /// attempts.
    ///
    /// When a failure carries [`ErrorClassification::retry_after`], the next
    /// wait is at least that long.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorClassification + std::error::Error + Send + Sync + 'static,
    {
        self.run_attempts(cancel, |_| {
            let attempt = operation();
            async move { attempt.await.map_err(ResilienceError::Operation) }
        })
        .await
    }

    /// Core loop shared with the manager, whose attempts already carry
    /// timeout and cancellation outcomes.
    #[instrument(skip(self, cancel, attempt_fn), fields(max_attempts = self.config.max_attempts))]
    pub(crate) async fn run_attempts<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ResilienceResult<T, E>>,
        E: ErrorClassification + std::error::Error + Send + Sync + 'static,
    {
        let mut attempt: u32 = 0;
        let mut retry_after: Option<Duration> = None;

        loop {
            if attempt > 0 {
                // A hint from the failed attempt is a floor, never a cap.
                let delay = self.jittered_delay(attempt).max(retry_after.unwrap_or_default());
                debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Backing off before retry"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        debug!(attempt, "Retry cancelled during backoff");
                        return Err(ResilienceError::Cancelled);
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }

            let error = match attempt_fn(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "Operation succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !self.is_retryable(&error) {
                debug!(attempt, kind = error.kind(), "Non-retryable failure, giving up");
                return Err(error);
            }

            retry_after = error.retry_after();
            if attempt >= self.config.max_attempts {
                warn!(attempts = attempt + 1, error = %error, "All retry attempts exhausted");
                return Err(ResilienceError::RetryExhausted {
                    attempts: attempt + 1,
                    last_error: Box::new(error),
                });
            }

            attempt += 1;
        }
    }
}
