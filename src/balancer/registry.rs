//! Named load balancers shared across the process.

use crate::balancer::{LoadBalancer, LoadBalancerStats};
use crate::config::{Config, HealthCheckDefaults, ServiceConfig, StrategyKind};
use crate::events::EventBus;
use crate::metrics::MetricsCollector;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Health of a service or of the whole fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every instance is healthy.
    Healthy,
    /// Some instances are unhealthy, at least one is healthy.
    Degraded,
    /// No healthy instance.
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub status: HealthStatus,
    pub healthy_instances: usize,
    pub total_instances: usize,
}

/// Aggregate health over every registered service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub services: Vec<ServiceHealth>,
}

impl HealthReport {
    /// True when every service can serve calls.
    pub fn is_serving(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

/// Owns one load balancer per service name.
pub struct LoadBalancerRegistry {
    balancers: DashMap<String, Arc<LoadBalancer>>,
    events: Option<EventBus>,
    metrics: Option<MetricsCollector>,
}

impl LoadBalancerRegistry {
    pub fn new() -> Self {
        Self {
            balancers: DashMap::new(),
            events: None,
            metrics: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the balancer for `service`, creating an empty one if absent.
    ///
    /// The first call decides the strategy.
    pub fn get_or_create(&self, service: &str, strategy: StrategyKind) -> Arc<LoadBalancer> {
        self.get_or_insert_with(service, || self.build(LoadBalancer::new(service, strategy)))
    }

    /// Get the balancer for `config.name`, creating it from `config` if absent.
    ///
    /// An existing balancer is returned untouched; see
    /// [`apply_config`](Self::apply_config) for reconciliation.
    pub fn get_or_create_from_config(
        &self,
        config: &ServiceConfig,
        health_defaults: &HealthCheckDefaults,
    ) -> Arc<LoadBalancer> {
        self.get_or_insert_with(&config.name, || {
            let mut balancer = LoadBalancer::new(config.name.clone(), config.strategy)
                .with_scaling_rules(config.scaling_rules.clone());
            if let Some(check) = &config.health_check {
                balancer = balancer.with_health_check(health_defaults.resolve(check));
            }
            let balancer = self.build(balancer);
            for instance in &config.instances {
                balancer.register_instance(instance.clone());
            }
            balancer
        })
    }

    fn get_or_insert_with<F>(&self, service: &str, create: F) -> Arc<LoadBalancer>
    where
        F: FnOnce() -> LoadBalancer,
    {
        if let Some(existing) = self.balancers.get(service) {
            return Arc::clone(existing.value());
        }

        let entry = self.balancers.entry(service.to_string()).or_insert_with(|| {
            let balancer = create();
            info!(
                service = %service,
                strategy = ?balancer.strategy(),
                instances = balancer.instance_count(),
                "load balancer created"
            );
            Arc::new(balancer)
        });
        Arc::clone(entry.value())
    }

    fn build(&self, mut balancer: LoadBalancer) -> LoadBalancer {
        if let Some(events) = &self.events {
            balancer = balancer.with_events(events.clone());
        }
        if let Some(metrics) = &self.metrics {
            balancer = balancer.with_metrics(metrics.clone());
        }
        balancer
    }

    pub fn get(&self, service: &str) -> Option<Arc<LoadBalancer>> {
        self.balancers.get(service).map(|b| Arc::clone(b.value()))
    }

    /// Remove a balancer and stop its health checks.
    pub async fn remove(&self, service: &str) -> bool {
        let Some((_, balancer)) = self.balancers.remove(service) else {
            return false;
        };

        balancer.stop_health_checks().await;
        for instance in balancer.instances() {
            if let Some(metrics) = &self.metrics {
                metrics.remove_instance(service, instance.id());
            }
        }
        info!(service = %service, "load balancer removed");
        true
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.balancers.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.balancers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balancers.is_empty()
    }

    /// Stats for every balancer, sorted by service.
    pub fn all_stats(&self) -> Vec<LoadBalancerStats> {
        let mut stats: Vec<_> = self.balancers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    /// Health of every service and of the fleet as a whole.
    pub fn health_report(&self) -> HealthReport {
        let services: Vec<ServiceHealth> = self
            .all_stats()
            .into_iter()
            .map(|stats| {
                let status = match stats.healthy_instances {
                    0 => HealthStatus::Unhealthy,
                    n if n == stats.total_instances => HealthStatus::Healthy,
                    _ => HealthStatus::Degraded,
                };
                ServiceHealth {
                    service: stats.service,
                    status,
                    healthy_instances: stats.healthy_instances,
                    total_instances: stats.total_instances,
                }
            })
            .collect();

        let status = if services.iter().any(|s| s.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if services.iter().any(|s| s.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport { status, services }
    }

    fn all(&self) -> Vec<Arc<LoadBalancer>> {
        self.balancers.iter().map(|b| Arc::clone(b.value())).collect()
    }

    /// Start health checks on every balancer that has them configured.
    pub fn start_health_checks(&self) -> usize {
        self.all()
            .iter()
            .filter(|balancer| balancer.probe_settings().is_some())
            .filter(|balancer| balancer.start_health_checks())
            .count()
    }

    /// Stop every health check task.
    pub async fn stop_all(&self) {
        for balancer in self.all() {
            balancer.stop_health_checks().await;
        }
    }

    /// Bring the registry in line with `config`.
    ///
    /// New services are created and their health checks started; services
    /// missing from `config` are removed. For existing services, changed or
    /// new instances are (re-)registered, missing instances unregistered and
    /// scaling rules replaced. Strategy and health check changes need a
    /// restart.
    pub async fn apply_config(&self, config: &Config) {
        let wanted: HashSet<&str> = config.services.iter().map(|s| s.name.as_str()).collect();

        for name in self.names() {
            if !wanted.contains(name.as_str()) {
                self.remove(&name).await;
            }
        }

        for service in &config.services {
            match self.get(&service.name) {
                Some(balancer) => self.reconcile(&balancer, service, &config.health_check_defaults),
                None => {
                    let balancer =
                        self.get_or_create_from_config(service, &config.health_check_defaults);
                    if balancer.probe_settings().is_some() {
                        balancer.start_health_checks();
                    }
                }
            }
        }

        info!(services = self.len(), "load balancer configuration applied");
    }

    fn reconcile(&self, balancer: &LoadBalancer, config: &ServiceConfig, defaults: &HealthCheckDefaults) {
        if balancer.strategy() != config.strategy {
            warn!(
                service = %config.name,
                current = ?balancer.strategy(),
                requested = ?config.strategy,
                "strategy change ignored until restart"
            );
        }

        let requested = config.health_check.as_ref().map(|check| defaults.resolve(check));
        if balancer.probe_settings() != requested.as_ref() {
            warn!(service = %config.name, "health check change ignored until restart");
        }

        let wanted: HashSet<&str> = config.instances.iter().map(|i| i.id.as_str()).collect();
        for instance in balancer.instances() {
            if !wanted.contains(instance.id()) {
                balancer.unregister_instance(instance.id());
            }
        }

        for instance in &config.instances {
            let unchanged = balancer
                .instance(&instance.id)
                .is_some_and(|existing| existing.matches(instance));
            if !unchanged {
                balancer.register_instance(instance.clone());
            }
        }

        if balancer.scaling_rules() != config.scaling_rules {
            balancer.set_scaling_rules(config.scaling_rules.clone());
        }
    }
}

impl Default for LoadBalancerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, InstanceConfig};

    const CONFIG: &str = r#"
services:
  - name: api
    strategy: round_robin
    instances:
      - { id: api-1, host: 10.0.0.1, port: 8080 }
      - { id: api-2, host: 10.0.0.2, port: 8080 }
  - name: search
    strategy: least_connections
    instances:
      - { id: search-1, host: 10.0.1.1, port: 9200 }
"#;

    #[test]
    fn test_first_writer_wins() {
        let registry = LoadBalancerRegistry::new();
        let a = registry.get_or_create("api", StrategyKind::RoundRobin);
        let b = registry.get_or_create("api", StrategyKind::LeastConnections);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.strategy(), StrategyKind::RoundRobin);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = LoadBalancerRegistry::new();
        registry.get_or_create("api", StrategyKind::RoundRobin);
        assert!(registry.remove("api").await);
        assert!(!registry.remove("api").await);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_apply_config_creates_services() {
        let registry = LoadBalancerRegistry::new();
        registry.apply_config(&parse_config(CONFIG).unwrap()).await;

        assert_eq!(registry.names(), ["api", "search"]);
        let search = registry.get("search").unwrap();
        assert_eq!(search.strategy(), StrategyKind::LeastConnections);
        assert_eq!(registry.get("api").unwrap().instance_count(), 2);
    }

    #[tokio::test]
    async fn test_apply_config_reconciles() {
        let registry = LoadBalancerRegistry::new();
        registry.apply_config(&parse_config(CONFIG).unwrap()).await;

        let api = registry.get("api").unwrap();
        let kept = api.instance("api-1").unwrap();
        let _busy = api.get_next_instance(None).unwrap();

        let updated = r#"
services:
  - name: api
    instances:
      - { id: api-1, host: 10.0.0.1, port: 8080 }
      - { id: api-3, host: 10.0.0.3, port: 8080, weight: 2 }
    scaling_rules:
      - { name: cpu-high, metric: cpu_usage, threshold: 80, action: scale_up }
"#;
        registry.apply_config(&parse_config(updated).unwrap()).await;

        assert_eq!(registry.names(), ["api"]);
        let ids: Vec<_> = api.instances().iter().map(|i| i.id().to_string()).collect();
        assert_eq!(ids, ["api-1", "api-3"]);
        // Unchanged instances keep their live counters.
        assert!(Arc::ptr_eq(&kept, &api.instance("api-1").unwrap()));
        assert_eq!(kept.active_connections(), 1);
        assert_eq!(api.scaling_rules().len(), 1);
    }

    #[test]
    fn test_health_report() {
        let registry = LoadBalancerRegistry::new();
        let api = registry.get_or_create("api", StrategyKind::RoundRobin);
        api.register_instance(InstanceConfig::new("api-1", "10.0.0.1", 8080));
        api.register_instance(InstanceConfig::new("api-2", "10.0.0.2", 8080));

        let report = registry.health_report();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.is_serving());

        api.instance("api-2").unwrap().set_healthy(false);
        assert_eq!(registry.health_report().status, HealthStatus::Degraded);

        let search = registry.get_or_create("search", StrategyKind::RoundRobin);
        search.register_instance(InstanceConfig::new("search-1", "10.0.1.1", 9200));
        search.instance("search-1").unwrap().set_healthy(false);

        let report = registry.health_report();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.is_serving());
        assert_eq!(report.services[1].service, "search");
        assert_eq!(report.services[1].healthy_instances, 0);
    }

    #[test]
    fn test_all_stats_sorted() {
        let registry = LoadBalancerRegistry::new();
        registry.get_or_create("b", StrategyKind::RoundRobin);
        registry.get_or_create("a", StrategyKind::RoundRobin);
        let services: Vec<_> = registry.all_stats().into_iter().map(|s| s.service).collect();
        assert_eq!(services, ["a", "b"]);
    }
}
