//! Orchestration of every resilience stage behind one call
//!
//! [`ResilienceManager::execute`] runs an operation through, in order:
//!
//! 1. the circuit breaker,
//! 2. the rate limiter,
//! 3. the bulkhead,
//! 4. the retry loop, with each attempt bounded by the operation timeout.
//!
//! Each admission stage fails fast with its own error and the call never
//! reaches the next stage. Rejections are counted per stage. A call that ran
//! is recorded exactly once in the circuit breaker and the metrics collector,
//! no matter how many attempts the retry loop made.
//!
//! No two components' locks are ever held at the same time; the manager
//! calls them one after another.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bulkhead::{Bulkhead, BulkheadError, BulkheadMetrics};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics};
use crate::clock::{Clock, SystemClock};
use crate::config::ResilienceConfig;
use crate::error::{
    ConfigResult, ErrorClassification, ResilienceError, ResilienceResult, ShutdownError,
};
use crate::health::{AlwaysHealthy, HealthChecker, HealthMetrics, HealthProbe};
use crate::metrics::{MetricsCollector, MetricsSnapshot, RejectionReason};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryManager;

/// Aggregated view over every component.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceMetrics {
    /// Breaker state and counters.
    pub circuit_breaker: CircuitBreakerMetrics,
    /// Tokens left in the rate limiter.
    pub rate_limit_tokens: u64,
    /// Bulkhead occupancy.
    pub bulkhead: BulkheadMetrics,
    /// Health checker state.
    pub health: HealthMetrics,
    /// Call outcomes and rejections.
    pub calls: MetricsSnapshot,
}

/// Single entry point for resilient execution.
///
/// Safe to share between tasks (wrap in an `Arc`). Owns the bulkhead
/// dispatcher and the health checker worker; call
/// [`shutdown`](Self::shutdown) to stop them and wait for them to exit.
pub struct ResilienceManager<C: Clock + Clone = SystemClock> {
    config: ResilienceConfig,
    circuit_breaker: CircuitBreaker<C>,
    rate_limiter: RateLimiter<C>,
    bulkhead: Bulkhead,
    retry_manager: RetryManager,
    health_checker: HealthChecker<C>,
    metrics: MetricsCollector,
    shut_down: AtomicBool,
}

impl<C: Clock + Clone> fmt::Debug for ResilienceManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("circuit_state", &self.circuit_breaker.get_state())
            .field("bulkhead", &self.bulkhead)
            .field("health", &self.health_checker.get_status())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ResilienceManager<SystemClock> {
    /// Manager with the placeholder health probe.
    ///
    /// Must be called inside a Tokio runtime when the bulkhead or health
    /// checker is enabled.
    pub fn new(config: ResilienceConfig) -> ConfigResult<Self> {
        Self::with_clock(config, Arc::new(AlwaysHealthy), SystemClock)
    }

    /// Manager whose health checker runs `probe`.
    pub fn with_health_probe(
        config: ResilienceConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> ConfigResult<Self> {
        Self::with_clock(config, probe, SystemClock)
    }
}

impl<C: Clock + Clone> ResilienceManager<C> {
    /// Manager reading time from `clock`.
    pub fn with_clock(
        config: ResilienceConfig,
        probe: Arc<dyn HealthProbe>,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;

        let circuit_breaker =
            CircuitBreaker::with_clock(config.circuit_breaker.clone(), clock.clone())?;
        let rate_limiter = RateLimiter::with_clock(config.rate_limit.clone(), clock.clone())?;
        let retry_manager = RetryManager::new(config.retry.clone())?;
        let metrics = MetricsCollector::new(config.metrics.clone())?;
        let bulkhead = Bulkhead::new(config.bulkhead.clone())?;
        let health_checker =
            HealthChecker::with_clock(config.health_check.clone(), probe, clock)?;

        info!(
            circuit_breaker = config.circuit_breaker.enabled,
            rate_limit = config.rate_limit.enabled,
            bulkhead = config.bulkhead.enabled,
            health_check = config.health_check.enabled,
            max_retries = config.retry.max_attempts,
            "Resilience manager started"
        );

        Ok(Self {
            config,
            circuit_breaker,
            rate_limiter,
            bulkhead,
            retry_manager,
            health_checker,
            metrics,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Run `operation` through every stage.
    ///
    /// The operation receives a token that is cancelled when its attempt
    /// times out.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorClassification + std::error::Error + Send + Sync + 'static,
    {
        self.execute_with_cancellation(&CancellationToken::new(), operation).await
    }

    /// Like [`execute`](Self::execute), honoring the caller's `cancel` token
    /// at every wait.
    ///
    /// Each attempt gets a child of `cancel`, so cancelling the caller's
    /// token also reaches the operation. A token already cancelled on entry
    /// returns `Cancelled` without touching any stage or counter.
    #[instrument(skip_all)]
    pub async fn execute_with_cancellation<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorClassification + std::error::Error + Send + Sync + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ResilienceError::ShutDown);
        }
        if cancel.is_cancelled() {
            debug!("Call cancelled before admission");
            return Err(ResilienceError::Cancelled);
        }

        if !self.circuit_breaker.allow_request() {
            self.metrics.record_rejection(RejectionReason::CircuitBreaker);
            debug!("Call rejected by circuit breaker");
            return Err(ResilienceError::CircuitOpen);
        }

        if !self.rate_limiter.allow() {
            self.metrics.record_rejection(RejectionReason::RateLimit);
            debug!("Call rejected by rate limiter");
            return Err(ResilienceError::RateLimited);
        }

        let permit = match self.bulkhead.acquire(cancel).await {
            Ok(permit) => permit,
            Err(error) => {
                if error != BulkheadError::ShutDown {
                    self.metrics.record_rejection(RejectionReason::Bulkhead);
                }
                debug!(error = %error, "Call rejected by bulkhead");
                return Err(error.into());
            }
        };

        let operation_timeout = self.config.timeout.operation_timeout;
        let started = tokio::time::Instant::now();
        let result = self
            .retry_manager
            .run_attempts(cancel, |attempt| {
                let attempt_token = cancel.child_token();
                let attempt_future = operation(attempt_token.clone());
                run_attempt(attempt_future, attempt_token, cancel, operation_timeout, attempt)
            })
            .await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => {
                self.circuit_breaker.record_success();
                self.metrics.record_success(elapsed);
            }
            Err(error) => {
                self.circuit_breaker.record_failure();
                self.metrics.record_failure(elapsed);
                debug!(kind = error.kind(), error = %error, "Call failed");
            }
        }

        self.bulkhead.release(permit);
        result
    }

    /// The circuit breaker.
    pub fn circuit_breaker(&self) -> &CircuitBreaker<C> {
        &self.circuit_breaker
    }

    /// The rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter<C> {
        &self.rate_limiter
    }

    /// The bulkhead.
    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    /// The retry manager.
    pub fn retry_manager(&self) -> &RetryManager {
        &self.retry_manager
    }

    /// The health checker.
    pub fn health_checker(&self) -> &HealthChecker<C> {
        &self.health_checker
    }

    /// The metrics collector.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// The configuration the manager was built from.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Whether the health checker reports `Healthy`.
    pub fn is_healthy(&self) -> bool {
        self.health_checker.is_healthy()
    }

    /// Snapshot of every component.
    pub fn get_metrics(&self) -> ResilienceMetrics {
        ResilienceMetrics {
            circuit_breaker: self.circuit_breaker.get_metrics(),
            rate_limit_tokens: self.rate_limiter.available_tokens(),
            bulkhead: self.bulkhead.get_metrics(),
            health: self.health_checker.get_metrics(),
            calls: self.metrics.get_metrics(),
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the bulkhead dispatcher and the health checker.
    ///
    /// Later calls fail with [`ResilienceError::ShutDown`]. Both workers are
    /// stopped even if the first one fails to; the first error is returned.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.shut_down.store(true, Ordering::Release);

        let bulkhead = self.bulkhead.shutdown().await;
        let health = self.health_checker.stop().await;
        info!("Resilience manager shut down");
        bulkhead.and(health)
    }
}

/// One attempt under the per-attempt deadline.
async fn run_attempt<Fut, T, E>(
    attempt_future: Fut,
    attempt_token: CancellationToken,
    cancel: &CancellationToken,
    deadline: Duration,
    attempt: u32,
) -> ResilienceResult<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ResilienceError::Cancelled),
        outcome = tokio::time::timeout(deadline, attempt_future) => match outcome {
            Ok(result) => result.map_err(ResilienceError::Operation),
            Err(_) => {
                attempt_token.cancel();
                warn!(
                    attempt,
                    timeout_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    "Attempt timed out"
                );
                Err(ResilienceError::OperationTimeout { timeout: deadline })
            }
        },
    }
}
