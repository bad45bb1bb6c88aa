//! Failure-rate circuit breaker
//!
//! The breaker watches call outcomes and fails fast once the protected
//! dependency looks unhealthy:
//!
//! - `Closed`: every call is admitted. When at least
//!   `minimum_request_threshold` outcomes have been recorded and either the
//!   failure count reaches `failure_threshold` or the failure ratio reaches
//!   `failure_rate_threshold`, the breaker trips to `Open`.
//! - `Open`: calls are rejected until `timeout` has passed since the trip.
//!   The first call after that moves the breaker to `HalfOpen` and is
//!   admitted as the first probe.
//! - `HalfOpen`: at most `half_open_max_calls` probes are admitted. Any
//!   failure reopens the breaker; `success_threshold` successes close it.
//!
//! All counters and timestamps sit behind one mutex so a transition is never
//! observed half-applied.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::duration_millis;
use crate::error::{ConfigError, ConfigResult};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of probes test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// When false the breaker admits everything and records nothing.
    pub enabled: bool,
    /// Failures that trip the breaker.
    pub failure_threshold: u64,
    /// Half-open successes that close the breaker.
    pub success_threshold: u64,
    /// How long the breaker stays open before probing.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Probes admitted per half-open window.
    pub half_open_max_calls: u64,
    /// Failure ratio that trips the breaker.
    pub failure_rate_threshold: f64,
    /// Outcomes required before the trip condition is evaluated.
    pub minimum_request_threshold: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            failure_rate_threshold: 0.5,
            minimum_request_threshold: 10,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Enabled breaker that trips after `failure_threshold` failures and
    /// needs half as many successes to close.
    pub fn quick(failure_threshold: u64, timeout: Duration) -> Self {
        Self {
            enabled: true,
            failure_threshold,
            success_threshold: (failure_threshold / 2).clamp(1, 3),
            timeout,
            half_open_max_calls: 3,
            failure_rate_threshold: 0.5,
            minimum_request_threshold: failure_threshold,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid("half_open_max_calls must be greater than 0"));
        }
        if self.success_threshold > self.half_open_max_calls {
            return Err(ConfigError::invalid(
                "success_threshold cannot exceed half_open_max_calls",
            ));
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 1.0) {
            return Err(ConfigError::invalid("failure_rate_threshold must be within (0, 1]"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Builder seeded with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the breaker.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Failures that trip the breaker.
    #[must_use]
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Half-open successes that close the breaker.
    #[must_use]
    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Open period before probing.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Probes admitted per half-open window.
    #[must_use]
    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    /// Failure ratio that trips the breaker.
    #[must_use]
    pub fn failure_rate_threshold(mut self, rate: f64) -> Self {
        self.config.failure_rate_threshold = rate;
        self
    }

    /// Outcomes required before tripping is considered.
    #[must_use]
    pub fn minimum_request_threshold(mut self, minimum: u64) -> Self {
        self.config.minimum_request_threshold = minimum;
        self
    }

    /// Validate and return the config.
    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Current state.
    pub state: CircuitState,
    /// Failures since the breaker last closed.
    pub failures: u64,
    /// Successes since the breaker last closed or entered half-open.
    pub successes: u64,
    /// Outcomes since the breaker last closed.
    pub requests: u64,
    /// Probes admitted in the current half-open window.
    pub half_open_admitted: u64,
    /// Time of the most recent failure.
    pub last_failure_at: Option<Instant>,
    /// Time of the most recent transition.
    pub state_changed_at: Instant,
}

impl CircuitBreakerMetrics {
    /// Failures divided by requests, zero when nothing was recorded.
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.failures as f64 / self.requests as f64
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u64,
    successes: u64,
    requests: u64,
    half_open_admitted: u64,
    last_failure_at: Option<Instant>,
    state_changed_at: Instant,
}

impl BreakerState {
    fn closed(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            requests: 0,
            half_open_admitted: 0,
            last_failure_at: None,
            state_changed_at: now,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        let from = self.state;
        self.state = to;
        self.state_changed_at = now;
        match to {
            CircuitState::Closed => {
                self.failures = 0;
                self.successes = 0;
                self.requests = 0;
                self.half_open_admitted = 0;
            }
            CircuitState::HalfOpen => {
                self.successes = 0;
                self.half_open_admitted = 0;
            }
            CircuitState::Open => {}
        }
        info!(
            from = %from,
            to = %to,
            failures = self.failures,
            requests = self.requests,
            "Circuit breaker state changed"
        );
    }

    #[allow(clippy::cast_precision_loss)]
    fn should_trip(&self, config: &CircuitBreakerConfig) -> bool {
        if self.requests < config.minimum_request_threshold || self.requests == 0 {
            return false;
        }
        if self.failures >= config.failure_threshold {
            return true;
        }
        self.failures as f64 / self.requests as f64 >= config.failure_rate_threshold
    }
}

/// Circuit breaker guarding calls to one dependency.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.get_state())
            .finish_non_exhaustive()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Breaker on the system clock.
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Breaker reading time from `clock`.
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(BreakerState::closed(now))),
            clock: Arc::new(clock),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Circuit breaker state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Whether the breaker participates at all.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The breaker's configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decide whether a call may proceed.
    ///
    /// May move `Open` to `HalfOpen` once the open period has passed. In
    /// `HalfOpen` each `true` consumes one probe from the window.
    pub fn allow_request(&self) -> bool {
        if !self.config.enabled {
            return true;
        }

        let now = self.clock.now();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now.saturating_duration_since(inner.state_changed_at) < self.config.timeout {
                    debug!("Circuit breaker open, rejecting call");
                    return false;
                }
                inner.transition(CircuitState::HalfOpen, now);
                inner.half_open_admitted = 1;
                true
            }
            CircuitState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_max_calls {
                    inner.half_open_admitted += 1;
                    return true;
                }
                // A spent window that outlives the timeout starts over.
                if now.saturating_duration_since(inner.state_changed_at) >= self.config.timeout {
                    warn!("Half-open window expired without a verdict, opening a new one");
                    inner.transition(CircuitState::HalfOpen, now);
                    inner.half_open_admitted = 1;
                    return true;
                }
                debug!(
                    admitted = inner.half_open_admitted,
                    "Circuit breaker half-open window full, rejecting call"
                );
                false
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }

        let now = self.clock.now();
        let mut inner = self.lock();
        inner.requests += 1;
        inner.successes += 1;

        if inner.state == CircuitState::HalfOpen
            && inner.successes >= self.config.success_threshold
        {
            inner.transition(CircuitState::Closed, now);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }

        let now = self.clock.now();
        let mut inner = self.lock();
        inner.requests += 1;
        inner.failures += 1;
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed => {
                if inner.should_trip(&self.config) {
                    warn!(
                        failures = inner.failures,
                        requests = inner.requests,
                        "Circuit breaker tripped"
                    );
                    inner.transition(CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                warn!("Probe failed while half-open, reopening circuit breaker");
                inner.transition(CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state.
    ///
    /// Does not advance `Open` to `HalfOpen`; only admission does.
    pub fn get_state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of counters and timestamps.
    pub fn get_metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            requests: inner.requests,
            half_open_admitted: inner.half_open_admitted,
            last_failure_at: inner.last_failure_at,
            state_changed_at: inner.state_changed_at,
        }
    }

    /// Force the breaker closed and clear every counter.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        *inner = BreakerState::closed(now);
        info!("Circuit breaker manually reset to closed state");
    }
}
