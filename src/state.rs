//! Shared application state.

use crate::balancer::{LoadBalancerRegistry, LoadBalancerStats};
use crate::breaker::{CircuitBreakerRegistry, CircuitBreakerStats};
use crate::client::ServiceClient;
use crate::config::Config;
use crate::events::EventBus;
use crate::metrics::MetricsCollector;
use crate::util::ShutdownSignal;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Everything the stats endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub balancers: Vec<LoadBalancerStats>,
    pub breakers: Vec<CircuitBreakerStats>,
}

/// Shared state accessible from all tasks.
#[derive(Clone)]
pub struct AppState {
    /// Current configuration (can be swapped atomically for hot reload).
    config: Arc<ArcSwap<Config>>,
    balancers: Arc<LoadBalancerRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    client: Arc<ServiceClient>,
    metrics: MetricsCollector,
    events: EventBus,
    shutdown: ShutdownSignal,
}

impl AppState {
    /// Build empty registries wired to a shared event bus and metrics.
    ///
    /// Call [`apply_config`](Self::apply_config) to populate them.
    pub fn new(config: Config) -> Self {
        let metrics = MetricsCollector::new();
        let events = EventBus::new();

        let balancers = Arc::new(
            LoadBalancerRegistry::new()
                .with_events(events.clone())
                .with_metrics(metrics.clone()),
        );
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(config.circuit_breaker_defaults.clone())
                .with_events(events.clone())
                .with_metrics(metrics.clone()),
        );
        let client = Arc::new(
            ServiceClient::new(Arc::clone(&balancers), Arc::clone(&breakers))
                .with_metrics(metrics.clone()),
        );

        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            balancers,
            breakers,
            client,
            metrics,
            events,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Get the current configuration.
    pub fn config(&self) -> arc_swap::Guard<Arc<Config>> {
        self.config.load()
    }

    /// Reconcile the registries with the current configuration.
    pub async fn apply_config(&self) {
        let config = self.config.load_full();
        self.balancers.apply_config(&config).await;
        self.client.configure(&config);
    }

    /// Swap in `config` and reconcile the registries with it.
    pub async fn reload(&self, config: Config) {
        self.config.store(Arc::new(config));
        self.apply_config().await;
        info!("configuration reloaded");
    }

    pub fn balancers(&self) -> &Arc<LoadBalancerRegistry> {
        &self.balancers
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn client(&self) -> &Arc<ServiceClient> {
        &self.client
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Get the shutdown signal.
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Stats of every balancer and breaker.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            balancers: self.balancers.all_stats(),
            breakers: self.breakers.all_stats(),
        }
    }

    /// Trigger shutdown and stop every health check.
    pub async fn shutdown_all(&self) {
        self.shutdown.shutdown();
        self.balancers.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    const CONFIG: &str = r#"
circuit_breaker_defaults: { failure_threshold: 4, recovery_timeout: 30s }
services:
  - name: api
    instances:
      - { id: api-1, host: 10.0.0.1, port: 8080 }
  - name: search
    circuit_breaker: { failure_threshold: 2 }
    instances:
      - { id: search-1, host: 10.0.1.1, port: 9200 }
"#;

    #[tokio::test]
    async fn test_apply_config_builds_registries() {
        let state = AppState::new(parse_config(CONFIG).unwrap());
        state.apply_config().await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.balancers.len(), 2);
        assert_eq!(snapshot.breakers.len(), 2);
        assert_eq!(state.breakers().get("api").unwrap().config().failure_threshold, 4);
        assert_eq!(state.breakers().get("search").unwrap().config().failure_threshold, 2);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains(r#""service":"search""#));
    }

    #[tokio::test]
    async fn test_reload_swaps_and_reconciles() {
        let state = AppState::new(parse_config(CONFIG).unwrap());
        state.apply_config().await;

        let updated = CONFIG.replace("search-1, host: 10.0.1.1", "search-2, host: 10.0.1.2");
        state.reload(parse_config(&updated).unwrap()).await;

        let search = state.balancers().get("search").unwrap();
        assert!(search.instance("search-1").is_none());
        assert!(search.instance("search-2").is_some());
        assert_eq!(state.config().services.len(), 2);
    }
}
