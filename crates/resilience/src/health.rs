//! Background health checking with explicit lifecycle
//!
//! [`HealthChecker`] probes a dependency on a fixed interval and folds the
//! outcomes into a [`HealthStatus`]:
//!
//! - `failure_threshold` consecutive failures mark it `Unhealthy`.
//! - `recovery_threshold` consecutive successes mark it `Healthy`.
//! - Between thresholds the previous status stands. `Degraded` is only ever
//!   set from outside through [`HealthChecker::set_status`].
//!
//! The probe itself is pluggable through [`HealthProbe`]. [`AlwaysHealthy`]
//! is the default; [`HttpHealthProbe`] (feature `http-probe`) issues a GET
//! against the configured endpoint.
//!
//! # Architecture
//!
//! - `HealthChecker`: lifecycle owner (join handle plus cancellation token).
//! - `health_worker()`: the ticker loop, stopped by cancellation rather than
//!   by timer expiry.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agui_resilience::{AlwaysHealthy, HealthCheckConfig, HealthChecker};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let checker = HealthChecker::new(HealthCheckConfig::default(), Arc::new(AlwaysHealthy))?;
//!
//! // ... serve traffic ...
//!
//! checker.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::duration_millis;
use crate::error::{ConfigError, ConfigResult, ShutdownError};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Health check settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// When false no background worker runs and status stays `Unknown`
    /// unless checked or set by hand.
    pub enabled: bool,
    /// Time between probes.
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Deadline for a single probe.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Consecutive failures that mark the dependency unhealthy.
    pub failure_threshold: u32,
    /// Consecutive successes that mark it healthy again.
    pub recovery_threshold: u32,
    /// Path probed by [`HttpHealthProbe`].
    pub endpoint: String,
    /// Status codes [`HttpHealthProbe`] treats as healthy.
    pub expected_status_codes: Vec<u16>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
            recovery_threshold: 2,
            endpoint: "/health".to_string(),
            expected_status_codes: vec![200, 201, 202],
        }
    }
}

impl HealthCheckConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("health check interval must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("health check timeout must be greater than zero"));
        }
        if self.failure_threshold == 0 || self.recovery_threshold == 0 {
            return Err(ConfigError::invalid("health check thresholds must be greater than 0"));
        }
        if self.expected_status_codes.is_empty() {
            return Err(ConfigError::invalid("expected_status_codes must not be empty"));
        }
        Ok(())
    }
}

/// Health of the protected dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Probes are passing.
    Healthy,
    /// Probes keep failing.
    Unhealthy,
    /// Operational with reduced capacity; set externally.
    Degraded,
    /// Not enough information yet.
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Unhealthy => write!(f, "UNHEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A failed probe.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HealthProbeError {
    /// The endpoint answered with a status outside the expected set.
    #[error("unexpected health status code {status}")]
    UnexpectedStatus {
        /// Status code received.
        status: u16,
    },

    /// The request could not be completed.
    #[error("health probe transport error: {message}")]
    Transport {
        /// Underlying error text.
        message: String,
    },

    /// Probe-specific failure.
    #[error("health probe failed: {message}")]
    Failed {
        /// Why the probe failed.
        message: String,
    },
}

/// Checks whether a dependency is up.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Run one probe. The checker bounds it with its own timeout.
    async fn check(&self) -> Result<(), HealthProbeError>;
}

/// Probe that always passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn check(&self) -> Result<(), HealthProbeError> {
        Ok(())
    }
}

/// GET `base_url + endpoint` and compare the status code.
#[cfg(feature = "http-probe")]
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
    expected_status_codes: Vec<u16>,
}

#[cfg(feature = "http-probe")]
impl HttpHealthProbe {
    /// Probe with its own client whose request timeout is the check timeout.
    pub fn new(base_url: &str, config: &HealthCheckConfig) -> Result<Self, HealthProbeError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| HealthProbeError::Transport { message: e.to_string() })?;
        Ok(Self::with_client(client, base_url, config))
    }

    /// Probe sharing an existing client.
    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        config: &HealthCheckConfig,
    ) -> Self {
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            config.endpoint.trim_start_matches('/')
        );
        Self { client, url, expected_status_codes: config.expected_status_codes.clone() }
    }

    /// Fully resolved probe URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(feature = "http-probe")]
#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> Result<(), HealthProbeError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| HealthProbeError::Transport { message: e.to_string() })?;

        let status = response.status().as_u16();
        if self.expected_status_codes.contains(&status) {
            Ok(())
        } else {
            Err(HealthProbeError::UnexpectedStatus { status })
        }
    }
}

/// Snapshot of checker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthMetrics {
    /// Current status.
    pub status: HealthStatus,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// Probes run so far.
    pub total_checks: u64,
    /// Wall-clock time of the most recent probe.
    pub last_check: Option<SystemTime>,
    /// Error text of the most recent failed probe.
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct HealthState {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_checks: u64,
    last_check: Option<SystemTime>,
    last_error: Option<String>,
}

struct HealthShared<C: Clock> {
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    clock: C,
    state: Mutex<HealthState>,
}

impl<C: Clock> HealthShared<C> {
    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Health state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    async fn perform_check(&self) -> HealthStatus {
        let outcome = match tokio::time::timeout(self.config.timeout, self.probe.check()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("health probe timed out after {:?}", self.config.timeout)),
        };
        self.record(outcome)
    }

    fn record(&self, outcome: Result<(), String>) -> HealthStatus {
        let now = self.clock.system_time();
        let mut state = self.lock();
        let previous = state.status;

        state.total_checks += 1;
        state.last_check = Some(now);
        match outcome {
            Ok(()) => {
                state.consecutive_successes = state.consecutive_successes.saturating_add(1);
                state.consecutive_failures = 0;
                if state.consecutive_successes >= self.config.recovery_threshold {
                    state.status = HealthStatus::Healthy;
                }
            }
            Err(error) => {
                debug!(error = %error, "Health probe failed");
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.consecutive_successes = 0;
                state.last_error = Some(error);
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.status = HealthStatus::Unhealthy;
                }
            }
        }

        if state.status != previous {
            info!(previous_status = %previous, new_status = %state.status, "Health status changed");
        }
        state.status
    }
}

/// Periodic health prober with an explicit stop.
pub struct HealthChecker<C: Clock = SystemClock> {
    shared: Arc<HealthShared<C>>,
    cancellation: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Clock> fmt::Debug for HealthChecker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.shared.config)
            .field("status", &self.get_status())
            .finish_non_exhaustive()
    }
}

impl HealthChecker<SystemClock> {
    /// Checker on the system clock. Spawns the ticker when enabled.
    pub fn new(config: HealthCheckConfig, probe: Arc<dyn HealthProbe>) -> ConfigResult<Self> {
        Self::with_clock(config, probe, SystemClock)
    }
}

impl<C: Clock> HealthChecker<C> {
    /// Checker stamping `last_check` from `clock`.
    pub fn with_clock(
        config: HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;

        let enabled = config.enabled;
        let interval = config.interval;
        let shared = Arc::new(HealthShared {
            config,
            probe,
            clock,
            state: Mutex::new(HealthState {
                status: HealthStatus::Unknown,
                consecutive_failures: 0,
                consecutive_successes: 0,
                total_checks: 0,
                last_check: None,
                last_error: None,
            }),
        });
        let cancellation = CancellationToken::new();

        let task_handle = if enabled {
            let handle = Handle::try_current()
                .map_err(|e| ConfigError::RuntimeUnavailable { message: e.to_string() })?;
            info!(interval_ms = duration_ms(interval), "Starting health checker");
            Some(handle.spawn(health_worker(Arc::clone(&shared), interval, cancellation.clone())))
        } else {
            None
        };

        Ok(Self { shared, cancellation, task_handle: Mutex::new(task_handle) })
    }

    /// The checker's configuration.
    pub fn config(&self) -> &HealthCheckConfig {
        &self.shared.config
    }

    /// Current status.
    pub fn get_status(&self) -> HealthStatus {
        self.shared.lock().status
    }

    /// True only when the status is `Healthy`.
    pub fn is_healthy(&self) -> bool {
        self.get_status() == HealthStatus::Healthy
    }

    /// Override the status, typically to report `Degraded`.
    ///
    /// Probe counting continues from the current streaks, so the next
    /// threshold crossing replaces the override.
    pub fn set_status(&self, status: HealthStatus) {
        let mut state = self.shared.lock();
        if state.status != status {
            info!(previous_status = %state.status, new_status = %status, "Health status set");
            state.status = status;
        }
    }

    /// Run one probe now, outside the schedule.
    pub async fn check_now(&self) -> HealthStatus {
        self.shared.perform_check().await
    }

    /// Counters and timestamps.
    pub fn get_metrics(&self) -> HealthMetrics {
        let state = self.shared.lock();
        HealthMetrics {
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            total_checks: state.total_checks,
            last_check: state.last_check,
            last_error: state.last_error.clone(),
        }
    }

    /// Stop the ticker and wait for it to exit.
    ///
    /// Times out after 5 seconds if the worker does not stop.
    pub async fn stop(&self) -> Result<(), ShutdownError> {
        self.cancellation.cancel();

        let handle = self.task_handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            tokio::time::timeout(SHUTDOWN_GRACE, handle)
                .await
                .map_err(|_| ShutdownError::Timeout {
                    component: "health_checker",
                    timeout: SHUTDOWN_GRACE,
                })?
                .map_err(|e| ShutdownError::Join {
                    component: "health_checker",
                    message: e.to_string(),
                })?;
            info!("Health checker stopped");
        }
        Ok(())
    }

    /// Whether the ticker is running.
    pub fn is_running(&self) -> bool {
        let has_task = self.task_handle.lock().unwrap_or_else(PoisonError::into_inner).is_some();
        has_task && !self.cancellation.is_cancelled()
    }
}

impl<C: Clock> Drop for HealthChecker<C> {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Ticker loop. The first probe runs one interval after start.
async fn health_worker<C: Clock>(
    shared: Arc<HealthShared<C>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = shared.perform_check() => {}
                }
            }
        }
    }
    info!("Health checker worker shutting down");
}
