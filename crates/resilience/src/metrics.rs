//! Outcome counters and response-time histogram
//!
//! [`MetricsCollector`] is a passive recorder. Every counter is an atomic, so
//! recording never blocks and never fails. Response times are bucketed only
//! when `enable_detailed_metrics` is on: each duration lands in the first
//! bucket whose upper bound (in milliseconds, fractions allowed) it does not
//! exceed, and anything slower than the last bound is counted as overflow.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Metrics settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// When false nothing is recorded.
    pub enabled: bool,
    /// Ascending bucket upper bounds in milliseconds. Sub-millisecond
    /// bounds such as `0.5` are kept as given.
    pub histogram_buckets: Vec<f64>,
    /// Record response times into the histogram.
    pub enable_detailed_metrics: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            histogram_buckets: vec![
                1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0,
                10_000.0,
            ],
            enable_detailed_metrics: true,
        }
    }
}

impl MetricsConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.enabled || !self.enable_detailed_metrics {
            return Ok(());
        }
        if self.histogram_buckets.is_empty() {
            return Err(ConfigError::invalid("histogram_buckets must not be empty"));
        }
        if self.histogram_buckets.iter().any(|bound| !bound.is_finite() || *bound <= 0.0) {
            return Err(ConfigError::invalid("histogram_buckets must be finite and positive"));
        }
        if self.histogram_buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::invalid("histogram_buckets must be strictly ascending"));
        }
        Ok(())
    }
}

/// Admission stage that turned a call away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// The circuit breaker was open.
    CircuitBreaker,
    /// The token bucket was empty.
    RateLimit,
    /// The bulkhead refused or timed out.
    Bulkhead,
}

impl RejectionReason {
    /// Stable label used in exported metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CircuitBreaker => "circuit_breaker",
            Self::RateLimit => "rate_limit",
            Self::Bulkhead => "bulkhead",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramBucket {
    /// Inclusive upper bound in milliseconds.
    pub le_ms: f64,
    /// Durations that landed here.
    pub count: u64,
}

/// Response-time distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseTimeHistogram {
    /// Per-bucket counts, not cumulative.
    pub buckets: Vec<HistogramBucket>,
    /// Durations above the last bound.
    pub overflow: u64,
}

impl ResponseTimeHistogram {
    /// Every recorded duration, overflow included.
    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|bucket| bucket.count).sum::<u64>() + self.overflow
    }
}

/// Point-in-time copy of the collector's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Calls that succeeded.
    pub success_count: u64,
    /// Calls that ran and failed.
    pub failure_count: u64,
    /// Calls rejected by the circuit breaker.
    pub circuit_breaker_rejects: u64,
    /// Calls rejected by the rate limiter.
    pub rate_limit_rejects: u64,
    /// Calls rejected by the bulkhead.
    pub bulkhead_rejects: u64,
    /// Present when detailed metrics are on.
    pub response_times: Option<ResponseTimeHistogram>,
}

impl MetricsSnapshot {
    /// Calls that ran, successfully or not.
    pub fn total_requests(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// Calls turned away before running.
    pub fn total_rejections(&self) -> u64 {
        self.circuit_breaker_rejects + self.rate_limit_rejects + self.bulkhead_rejects
    }

    /// Successes over calls that ran; 1.0 when nothing ran.
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 1.0;
        }
        self.success_count as f64 / total as f64
    }
}

/// Lock-free outcome recorder.
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    circuit_breaker_rejects: AtomicU64,
    rate_limit_rejects: AtomicU64,
    bulkhead_rejects: AtomicU64,
    histogram: Box<[AtomicU64]>,
    overflow: AtomicU64,
}

impl MetricsCollector {
    /// Collector with zeroed counters.
    pub fn new(config: MetricsConfig) -> ConfigResult<Self> {
        config.validate()?;
        let histogram = config.histogram_buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            config,
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            circuit_breaker_rejects: AtomicU64::new(0),
            rate_limit_rejects: AtomicU64::new(0),
            bulkhead_rejects: AtomicU64::new(0),
            histogram,
            overflow: AtomicU64::new(0),
        })
    }

    /// Whether anything is recorded.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The collector's configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    fn detailed(&self) -> bool {
        self.config.enabled && self.config.enable_detailed_metrics
    }

    /// Count a successful call and its duration.
    pub fn record_success(&self, duration: Duration) {
        if !self.config.enabled {
            return;
        }
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.record_response_time(duration);
    }

    /// Count a failed call and its duration.
    pub fn record_failure(&self, duration: Duration) {
        if !self.config.enabled {
            return;
        }
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.record_response_time(duration);
    }

    /// Count a call turned away at admission.
    pub fn record_rejection(&self, reason: RejectionReason) {
        if !self.config.enabled {
            return;
        }
        let counter = match reason {
            RejectionReason::CircuitBreaker => &self.circuit_breaker_rejects,
            RejectionReason::RateLimit => &self.rate_limit_rejects,
            RejectionReason::Bulkhead => &self.bulkhead_rejects,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_response_time(&self, duration: Duration) {
        if !self.detailed() {
            return;
        }
        let nanos = duration.as_nanos() as f64;
        let slot = self
            .config
            .histogram_buckets
            .iter()
            .position(|&bound_ms| nanos <= bound_ms * 1_000_000.0);
        match slot {
            Some(index) => self.histogram[index].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Copy of every counter.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let response_times = self.detailed().then(|| ResponseTimeHistogram {
            buckets: self
                .config
                .histogram_buckets
                .iter()
                .zip(self.histogram.iter())
                .map(|(&le_ms, count)| HistogramBucket {
                    le_ms,
                    count: count.load(Ordering::Relaxed),
                })
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
        });

        MetricsSnapshot {
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            circuit_breaker_rejects: self.circuit_breaker_rejects.load(Ordering::Relaxed),
            rate_limit_rejects: self.rate_limit_rejects.load(Ordering::Relaxed),
            bulkhead_rejects: self.bulkhead_rejects.load(Ordering::Relaxed),
            response_times,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(MetricsConfig::default()).expect("valid config")
    }

    fn bucket_count(snapshot: &MetricsSnapshot, le_ms: f64) -> u64 {
        snapshot
            .response_times
            .as_ref()
            .and_then(|histogram| {
                histogram.buckets.iter().find(|bucket| (bucket.le_ms - le_ms).abs() < f64::EPSILON)
            })
            .map_or(0, |bucket| bucket.count)
    }

    // =========================================================================
    // Counters
    // =========================================================================

    #[test]
    fn test_outcome_counters() {
        let metrics = collector();
        metrics.record_success(Duration::from_millis(3));
        metrics.record_success(Duration::from_millis(3));
        metrics.record_failure(Duration::from_millis(3));
        metrics.record_rejection(RejectionReason::CircuitBreaker);
        metrics.record_rejection(RejectionReason::RateLimit);
        metrics.record_rejection(RejectionReason::RateLimit);
        metrics.record_rejection(RejectionReason::Bulkhead);

        let snapshot = metrics.get_metrics();
        assert_eq!(snapshot.success_count, 2);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.circuit_breaker_rejects, 1);
        assert_eq!(snapshot.rate_limit_rejects, 2);
        assert_eq!(snapshot.bulkhead_rejects, 1);
        assert_eq!(snapshot.total_requests(), 3);
        assert_eq!(snapshot.total_rejections(), 4);
        assert!((snapshot.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    /// Validates repeated reads without activity return identical values.
    #[test]
    fn test_get_metrics_is_idempotent() {
        let metrics = collector();
        metrics.record_failure(Duration::from_millis(70));
        assert_eq!(metrics.get_metrics(), metrics.get_metrics());
    }

    #[test]
    fn test_disabled_records_nothing() {
        let config = MetricsConfig { enabled: false, ..MetricsConfig::default() };
        let metrics = MetricsCollector::new(config).expect("valid config");
        metrics.record_success(Duration::from_millis(1));
        metrics.record_rejection(RejectionReason::Bulkhead);

        let snapshot = metrics.get_metrics();
        assert_eq!(snapshot.total_requests(), 0);
        assert_eq!(snapshot.total_rejections(), 0);
        assert!(snapshot.response_times.is_none());
    }

    #[test]
    fn test_concurrent_recording() {
        let metrics = Arc::new(collector());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        metrics.record_success(Duration::from_millis(2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.get_metrics().success_count, 8_000);
    }

    // =========================================================================
    // Histogram
    // =========================================================================

    /// Validates first-fit bucketing with inclusive upper bounds.
    ///
    /// Assertions:
    /// - Exactly 1ms lands in the 1ms bucket.
    /// - 1.5ms lands in the 5ms bucket.
    /// - 10s lands in the last bucket; anything slower is overflow.
    #[test]
    fn test_first_fit_buckets() {
        let metrics = collector();
        metrics.record_success(Duration::from_millis(1));
        metrics.record_success(Duration::from_micros(1_500));
        metrics.record_success(Duration::from_secs(10));
        metrics.record_failure(Duration::from_secs(11));

        let snapshot = metrics.get_metrics();
        assert_eq!(bucket_count(&snapshot, 1.0), 1);
        assert_eq!(bucket_count(&snapshot, 5.0), 1);
        assert_eq!(bucket_count(&snapshot, 10_000.0), 1);

        let histogram = snapshot.response_times.expect("detailed metrics on");
        assert_eq!(histogram.overflow, 1);
        assert_eq!(histogram.total(), 4);
    }

    /// Validates sub-millisecond bounds keep their precision.
    ///
    /// Assertions:
    /// - 400µs and exactly 500µs land in the 0.5ms bucket.
    /// - 700µs lands in the 1ms bucket.
    /// - Fractional bounds load from JSON.
    #[test]
    fn test_sub_millisecond_buckets() {
        let config: MetricsConfig =
            serde_json::from_str(r#"{"histogram_buckets": [0.5, 1, 2.5]}"#).expect("parses");
        assert_eq!(config.histogram_buckets, vec![0.5, 1.0, 2.5]);
        let metrics = MetricsCollector::new(config).expect("valid config");

        metrics.record_success(Duration::from_micros(400));
        metrics.record_success(Duration::from_micros(500));
        metrics.record_success(Duration::from_micros(700));
        metrics.record_success(Duration::from_micros(2_600));

        let snapshot = metrics.get_metrics();
        assert_eq!(bucket_count(&snapshot, 0.5), 2);
        assert_eq!(bucket_count(&snapshot, 1.0), 1);
        assert_eq!(bucket_count(&snapshot, 2.5), 0);
        assert_eq!(snapshot.response_times.expect("detailed metrics on").overflow, 1);
    }

    #[test]
    fn test_detailed_flag_gates_histogram() {
        let config = MetricsConfig { enable_detailed_metrics: false, ..MetricsConfig::default() };
        let metrics = MetricsCollector::new(config).expect("valid config");
        metrics.record_success(Duration::from_millis(5));

        let snapshot = metrics.get_metrics();
        assert_eq!(snapshot.success_count, 1);
        assert!(snapshot.response_times.is_none());
    }

    #[test]
    fn test_bucket_validation() {
        let buckets = |bounds: Vec<f64>| MetricsConfig {
            histogram_buckets: bounds,
            ..MetricsConfig::default()
        };
        assert!(buckets(vec![5.0, 1.0]).validate().is_err());
        assert!(buckets(vec![1.0, 1.0]).validate().is_err());
        assert!(buckets(vec![0.0, 1.0]).validate().is_err());
        assert!(buckets(vec![1.0, f64::NAN]).validate().is_err());
        assert!(buckets(vec![1.0, f64::INFINITY]).validate().is_err());
        assert!(buckets(vec![0.25, 0.5, 1.0]).validate().is_ok());
        let empty = MetricsConfig { histogram_buckets: vec![], ..MetricsConfig::default() };
        assert!(empty.validate().is_err());
        let empty_but_coarse = MetricsConfig {
            histogram_buckets: vec![],
            enable_detailed_metrics: false,
            ..MetricsConfig::default()
        };
        assert!(empty_but_coarse.validate().is_ok());
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = collector();
        metrics.record_rejection(RejectionReason::RateLimit);
        let json = serde_json::to_value(metrics.get_metrics()).expect("snapshot serializes");
        assert_eq!(json["rate_limit_rejects"], 1);
        assert_eq!(json["response_times"]["buckets"][0]["le_ms"], 1.0);
        assert_eq!(RejectionReason::CircuitBreaker.to_string(), "circuit_breaker");
    }
}
