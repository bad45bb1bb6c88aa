//! Prometheus text exposition of resilience snapshots
//!
//! Gauges are registered on a registry the caller owns; nothing is global.
//! [`PrometheusExporter::export`] copies the manager's current
//! [`ResilienceMetrics`](crate::ResilienceMetrics) into the gauges, so scrape
//! handlers call it right before [`PrometheusExporter::encode`].

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::circuit_breaker::CircuitState;
use crate::clock::Clock;
use crate::health::HealthStatus;
use crate::manager::ResilienceManager;
use crate::metrics::RejectionReason;

/// Resilience gauges bound to one registry.
#[derive(Debug, Clone)]
pub struct PrometheusExporter {
    registry: Registry,
    calls: IntGaugeVec,
    rejections: IntGaugeVec,
    response_time_bucket: IntGaugeVec,
    circuit_breaker_state: IntGauge,
    circuit_breaker_failures: IntGauge,
    rate_limit_tokens: IntGauge,
    bulkhead_active: IntGauge,
    bulkhead_queued: IntGauge,
    bulkhead_rejected: IntGauge,
    bulkhead_timeouts: IntGauge,
    health_status: IntGaugeVec,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntGaugeVec, prometheus::Error> {
    let gauge = IntGaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn value<N: TryInto<i64>>(n: N) -> i64 {
    n.try_into().unwrap_or(i64::MAX)
}

impl PrometheusExporter {
    /// Register every gauge on `registry`.
    ///
    /// Fails with `AlreadyReg` when the registry already holds an exporter.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            registry: registry.clone(),
            calls: gauge_vec(
                registry,
                "resilience_calls",
                "Calls that ran, by outcome",
                &["outcome"],
            )?,
            rejections: gauge_vec(
                registry,
                "resilience_rejections",
                "Calls turned away at admission, by stage",
                &["reason"],
            )?,
            response_time_bucket: gauge_vec(
                registry,
                "resilience_response_time_ms_bucket",
                "Calls per response-time bucket (non-cumulative, le in milliseconds)",
                &["le"],
            )?,
            circuit_breaker_state: gauge(
                registry,
                "resilience_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            )?,
            circuit_breaker_failures: gauge(
                registry,
                "resilience_circuit_breaker_failures",
                "Failures counted since the breaker last closed",
            )?,
            rate_limit_tokens: gauge(
                registry,
                "resilience_rate_limit_tokens",
                "Tokens left in the rate limiter bucket",
            )?,
            bulkhead_active: gauge(
                registry,
                "resilience_bulkhead_active",
                "Bulkhead slots in use",
            )?,
            bulkhead_queued: gauge(
                registry,
                "resilience_bulkhead_queued",
                "Callers waiting for a bulkhead slot",
            )?,
            bulkhead_rejected: gauge(
                registry,
                "resilience_bulkhead_rejected",
                "Callers rejected because the bulkhead queue was full",
            )?,
            bulkhead_timeouts: gauge(
                registry,
                "resilience_bulkhead_timeouts",
                "Bulkhead waits that timed out",
            )?,
            health_status: gauge_vec(
                registry,
                "resilience_health_status",
                "1 for the current health status, 0 otherwise",
                &["status"],
            )?,
        })
    }

    /// Copy the manager's current snapshot into the gauges.
    pub fn export<C: Clock + Clone>(&self, manager: &ResilienceManager<C>) {
        let snapshot = manager.get_metrics();

        self.calls.with_label_values(&["success"]).set(value(snapshot.calls.success_count));
        self.calls.with_label_values(&["failure"]).set(value(snapshot.calls.failure_count));

        for (reason, count) in [
            (RejectionReason::CircuitBreaker, snapshot.calls.circuit_breaker_rejects),
            (RejectionReason::RateLimit, snapshot.calls.rate_limit_rejects),
            (RejectionReason::Bulkhead, snapshot.calls.bulkhead_rejects),
        ] {
            self.rejections.with_label_values(&[reason.as_str()]).set(value(count));
        }

        if let Some(histogram) = &snapshot.calls.response_times {
            for bucket in &histogram.buckets {
                self.response_time_bucket
                    .with_label_values(&[bucket.le_ms.to_string().as_str()])
                    .set(value(bucket.count));
            }
            self.response_time_bucket.with_label_values(&["+Inf"]).set(value(histogram.overflow));
        }

        let state = match snapshot.circuit_breaker.state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.circuit_breaker_state.set(state);
        self.circuit_breaker_failures.set(value(snapshot.circuit_breaker.failures));
        self.rate_limit_tokens.set(value(snapshot.rate_limit_tokens));

        self.bulkhead_active.set(value(snapshot.bulkhead.active_requests));
        self.bulkhead_queued.set(value(snapshot.bulkhead.queued_requests));
        self.bulkhead_rejected.set(value(snapshot.bulkhead.rejected_requests));
        self.bulkhead_timeouts.set(value(snapshot.bulkhead.timeouts));

        for status in [
            HealthStatus::Healthy,
            HealthStatus::Unhealthy,
            HealthStatus::Degraded,
            HealthStatus::Unknown,
        ] {
            let current = i64::from(status == snapshot.health.status);
            self.health_status.with_label_values(&[status.to_string().as_str()]).set(current);
        }
    }

    /// Render the registry in the text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::error::OperationError;

    /// Validates a snapshot lands in the rendered exposition.
    ///
    /// Assertions:
    /// - Success and failure counts appear under their outcome labels.
    /// - The closed breaker exports 0.
    /// - The overflow bucket is labelled `+Inf`.
    #[tokio::test]
    async fn test_export_and_encode() {
        let registry = Registry::new();
        let exporter = PrometheusExporter::new(&registry).expect("fresh registry");
        let manager = ResilienceManager::new(ResilienceConfig::minimal()).expect("valid config");

        manager.execute(|_| async { Ok::<_, OperationError>(()) }).await.expect("success");
        let _ = manager
            .execute(|_| async { Err::<(), _>(OperationError::permanent("nope")) })
            .await;

        exporter.export(&manager);
        let text = exporter.encode().expect("text encoding");

        assert!(text.contains(r#"resilience_calls{outcome="success"} 1"#), "{text}");
        assert!(text.contains(r#"resilience_calls{outcome="failure"} 1"#), "{text}");
        assert!(text.contains("resilience_circuit_breaker_state 0"), "{text}");
        assert!(text.contains(r#"resilience_health_status{status="UNKNOWN"} 1"#), "{text}");
    }

    #[tokio::test]
    async fn test_histogram_export() {
        let registry = Registry::new();
        let exporter = PrometheusExporter::new(&registry).expect("fresh registry");
        let mut config = ResilienceConfig::minimal();
        config.metrics.enable_detailed_metrics = true;
        let manager = ResilienceManager::new(config).expect("valid config");

        manager.execute(|_| async { Ok::<_, OperationError>(()) }).await.expect("success");
        exporter.export(&manager);
        let text = exporter.encode().expect("text encoding");

        assert!(text.contains(r#"resilience_response_time_ms_bucket{le="1"} 1"#), "{text}");
        assert!(text.contains(r#"resilience_response_time_ms_bucket{le="+Inf"} 0"#), "{text}");
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let _first = PrometheusExporter::new(&registry).expect("fresh registry");
        assert!(PrometheusExporter::new(&registry).is_err());
    }
}
