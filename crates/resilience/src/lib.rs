//! Resilience engine for agent client calls.
//!
//! Wraps outbound operations (tool invocations, requests to an agent server)
//! in a fixed pipeline of fault-tolerance stages:
//!
//! - **Circuit breaker**: fails fast while a dependency looks unhealthy and
//!   probes it for recovery.
//! - **Rate limiter**: token bucket with whole-second refill.
//! - **Bulkhead**: bounded concurrency with a FIFO wait queue.
//! - **Retry**: exponential backoff with additive jitter, each attempt under
//!   its own deadline.
//!
//! A background **health checker** and a passive **metrics collector**
//! complete the picture. [`ResilienceManager`] composes all of them behind a
//! single [`execute`](ResilienceManager::execute) call.
//!
//! # Feature Flags
//!
//! - `http-probe` (default): [`HttpHealthProbe`] via `reqwest`.
//! - `prometheus` (default): [`PrometheusExporter`] text exposition.
//!
//! # Example
//!
//! ```no_run
//! use agui_resilience::{OperationError, ResilienceConfig, ResilienceManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ResilienceManager::new(ResilienceConfig::production())?;
//!
//! let reply = manager
//!     .execute(|_cancel| async { Ok::<_, OperationError>("pong") })
//!     .await?;
//! assert_eq!(reply, "pong");
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
#[cfg(feature = "prometheus")]
pub mod export;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;

pub use bulkhead::{
    Bulkhead, BulkheadConfig, BulkheadConfigBuilder, BulkheadError, BulkheadMetrics, BulkheadPermit,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{ResilienceConfig, ResilienceConfigBuilder, TimeoutConfig};
pub use error::{
    ConfigError, ConfigResult, ErrorClassification, ErrorSeverity, OperationError,
    ResilienceError, ResilienceResult, ShutdownError,
};
#[cfg(feature = "prometheus")]
pub use export::PrometheusExporter;
#[cfg(feature = "http-probe")]
pub use health::HttpHealthProbe;
pub use health::{
    AlwaysHealthy, HealthCheckConfig, HealthChecker, HealthMetrics, HealthProbe, HealthProbeError,
    HealthStatus,
};
pub use manager::{ResilienceManager, ResilienceMetrics};
pub use metrics::{
    HistogramBucket, MetricsCollector, MetricsConfig, MetricsSnapshot, RejectionReason,
    ResponseTimeHistogram,
};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use retry::{RetryConfig, RetryConfigBuilder, RetryManager};
