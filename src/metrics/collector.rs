//! Metrics collector using prometheus-client.
//!
//! Provides metrics for breaker state and outcomes, instance health and
//! connections, health check results, and scaling recommendations.

use crate::breaker::CircuitState;
use crate::config::ScalingAction;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for per-breaker gauges.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BreakerLabels {
    pub breaker: String,
}

/// Labels for breaker call outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BreakerCallLabels {
    pub breaker: String,
    pub outcome: String,
}

/// Labels for breaker state transitions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub breaker: String,
    pub from: String,
    pub to: String,
}

/// Labels for per-instance metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InstanceLabels {
    pub service: String,
    pub instance: String,
}

/// Labels for per-service metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub service: String,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub service: String,
    pub instance: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthCheckResult {
    Success,
    Failure,
}

/// Labels for scaling recommendations.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ScalingLabels {
    pub service: String,
    pub rule: String,
    pub action: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Breaker state gauge (0 = closed, 1 = open, 2 = half-open).
    breaker_state: Family<BreakerLabels, Gauge>,
    /// Breaker call outcomes.
    breaker_calls: Family<BreakerCallLabels, Counter>,
    /// Breaker state transitions.
    breaker_transitions: Family<TransitionLabels, Counter>,
    /// Instance health gauge (1 = healthy, 0 = unhealthy).
    instance_health: Family<InstanceLabels, Gauge>,
    /// Active connections per instance.
    active_connections: Family<InstanceLabels, Gauge>,
    /// Health check results.
    health_checks_total: Family<HealthCheckLabels, Counter>,
    /// Scaling recommendations emitted.
    scaling_recommendations: Family<ScalingLabels, Counter>,
    /// Call duration histogram (in seconds).
    request_duration_seconds: Family<ServiceLabels, Histogram>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let breaker_state = Family::<BreakerLabels, Gauge>::default();
        let breaker_calls = Family::<BreakerCallLabels, Counter>::default();
        let breaker_transitions = Family::<TransitionLabels, Counter>::default();
        let instance_health = Family::<InstanceLabels, Gauge>::default();
        let active_connections = Family::<InstanceLabels, Gauge>::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();
        let scaling_recommendations = Family::<ScalingLabels, Counter>::default();
        let request_duration_seconds = Family::<ServiceLabels, Histogram>::new_with_constructor(
            || {
                // Buckets: 1ms, 2.5ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
                Histogram::new(exponential_buckets(0.001, 2.5, 13))
            },
        );

        registry.register(
            "fleetguard_breaker_state",
            "Circuit breaker state (0=closed, 1=open, 2=half_open)",
            breaker_state.clone(),
        );
        registry.register(
            "fleetguard_breaker_calls",
            "Calls seen by circuit breakers, by outcome",
            breaker_calls.clone(),
        );
        registry.register(
            "fleetguard_breaker_transitions",
            "Circuit breaker state transitions",
            breaker_transitions.clone(),
        );
        registry.register(
            "fleetguard_instance_health",
            "Instance health status (1=healthy, 0=unhealthy)",
            instance_health.clone(),
        );
        registry.register(
            "fleetguard_active_connections",
            "Connections currently leased to an instance",
            active_connections.clone(),
        );
        registry.register(
            "fleetguard_health_checks",
            "Total number of health checks performed",
            health_checks_total.clone(),
        );
        registry.register(
            "fleetguard_scaling_recommendations",
            "Scaling recommendations emitted",
            scaling_recommendations.clone(),
        );
        registry.register(
            "fleetguard_request_duration_seconds",
            "Duration of calls made through the service client",
            request_duration_seconds.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                breaker_state,
                breaker_calls,
                breaker_transitions,
                instance_health,
                active_connections,
                health_checks_total,
                scaling_recommendations,
                request_duration_seconds,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Encode every metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, self.registry())?;
        Ok(buffer)
    }

    /// Set the current state of a breaker.
    pub fn set_breaker_state(&self, breaker: &str, state: CircuitState) {
        let labels = BreakerLabels {
            breaker: breaker.to_string(),
        };
        self.inner
            .breaker_state
            .get_or_create(&labels)
            .set(state.as_gauge());
    }

    /// Count a call outcome (success, failure, ignored, timeout, rejected).
    pub fn record_breaker_call(&self, breaker: &str, outcome: &str) {
        let labels = BreakerCallLabels {
            breaker: breaker.to_string(),
            outcome: outcome.to_string(),
        };
        self.inner.breaker_calls.get_or_create(&labels).inc();
    }

    /// Count a state transition and update the state gauge.
    pub fn record_breaker_transition(&self, breaker: &str, from: CircuitState, to: CircuitState) {
        let labels = TransitionLabels {
            breaker: breaker.to_string(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        };
        self.inner.breaker_transitions.get_or_create(&labels).inc();
        self.set_breaker_state(breaker, to);
    }

    /// Update instance health status.
    pub fn set_instance_health(&self, service: &str, instance: &str, healthy: bool) {
        let labels = InstanceLabels {
            service: service.to_string(),
            instance: instance.to_string(),
        };
        self.inner
            .instance_health
            .get_or_create(&labels)
            .set(if healthy { 1 } else { 0 });
    }

    /// Set the leased connection count of an instance.
    pub fn set_active_connections(&self, service: &str, instance: &str, connections: u32) {
        let labels = InstanceLabels {
            service: service.to_string(),
            instance: instance.to_string(),
        };
        self.inner
            .active_connections
            .get_or_create(&labels)
            .set(i64::from(connections));
    }

    /// Drop the per-instance series of an unregistered instance.
    pub fn remove_instance(&self, service: &str, instance: &str) {
        let labels = InstanceLabels {
            service: service.to_string(),
            instance: instance.to_string(),
        };
        self.inner.instance_health.remove(&labels);
        self.inner.active_connections.remove(&labels);
    }

    /// Record a health check result.
    pub fn record_health_check(&self, service: &str, instance: &str, success: bool) {
        let labels = HealthCheckLabels {
            service: service.to_string(),
            instance: instance.to_string(),
            result: if success {
                HealthCheckResult::Success
            } else {
                HealthCheckResult::Failure
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    /// Count a scaling recommendation.
    pub fn record_scaling_recommendation(&self, service: &str, rule: &str, action: ScalingAction) {
        let labels = ScalingLabels {
            service: service.to_string(),
            rule: rule.to_string(),
            action: action.as_str().to_string(),
        };
        self.inner.scaling_recommendations.get_or_create(&labels).inc();
    }

    /// Record the duration of a call made through the service client.
    pub fn record_request(&self, service: &str, duration: Duration) {
        let labels = ServiceLabels {
            service: service.to_string(),
        };
        self.inner
            .request_duration_seconds
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}
