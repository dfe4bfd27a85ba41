//! Named circuit breakers shared across the process.

use crate::breaker::{CircuitBreaker, CircuitBreakerOptions, CircuitBreakerStats};
use crate::config::CircuitBreakerConfig;
use crate::events::EventBus;
use crate::metrics::MetricsCollector;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Owns one breaker per dependency name.
///
/// Construct once at startup and share by `Arc`. The first call for a name
/// decides that breaker's options; later options for the same name are
/// ignored until the breaker is removed.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitBreakerConfig,
    events: Option<EventBus>,
    metrics: Option<MetricsCollector>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose default options come from `defaults`.
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            events: None,
            metrics: None,
        }
    }

    /// Hand `events` to every breaker created from now on.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Hand `metrics` to every breaker created from now on.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Default options for breakers created without explicit options.
    pub fn default_options(&self) -> CircuitBreakerOptions {
        CircuitBreakerOptions::new(self.defaults.clone())
    }

    /// Get the breaker for `name`, creating it with `options` if absent.
    pub fn get_or_create(&self, name: &str, options: CircuitBreakerOptions) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            info!(
                breaker = name,
                failure_threshold = options.config().failure_threshold,
                recovery_timeout = ?options.config().recovery_timeout,
                "circuit breaker created"
            );
            let mut breaker = CircuitBreaker::new(name, options);
            if let Some(events) = &self.events {
                breaker = breaker.with_events(events.clone());
            }
            if let Some(metrics) = &self.metrics {
                breaker = breaker.with_metrics(metrics.clone());
            }
            Arc::new(breaker)
        });
        Arc::clone(entry.value())
    }

    /// Get the breaker for `name`, creating it with the registry defaults.
    pub fn get_or_default(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.default_options())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Remove a breaker. A later `get_or_create` starts a fresh one.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.breakers.remove(name).is_some();
        if removed {
            info!(breaker = name, "circuit breaker removed");
        }
        removed
    }

    /// Stats for every breaker, sorted by name.
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Reset every breaker to `Closed` with cleared counters.
    pub fn reset_all(&self) {
        // Collect first so resets (which log and publish) run without shard locks.
        let breakers: Vec<_> = self.breakers.iter().map(|b| Arc::clone(b.value())).collect();
        for breaker in &breakers {
            breaker.reset();
        }
        info!(count = breakers.len(), "all circuit breakers reset");
    }

    /// Registered breaker names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.breakers.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use std::time::Duration;

    async fn trip(breaker: &CircuitBreaker) {
        let _ = breaker.execute(|| async { Err::<(), _>("down") }).await;
    }

    #[test]
    fn test_same_name_returns_same_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_default("payments");
        let b = registry.get_or_default("payments");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_first_writer_wins() {
        let registry = CircuitBreakerRegistry::default();
        registry.get_or_create(
            "payments",
            CircuitBreakerOptions::default().failure_threshold(2),
        );
        let again = registry.get_or_create(
            "payments",
            CircuitBreakerOptions::default().failure_threshold(9),
        );
        assert_eq!(again.config().failure_threshold, 2);
    }

    #[test]
    fn test_defaults_come_from_config() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 7,
            recovery_timeout: Duration::from_secs(3),
        });
        let breaker = registry.get_or_default("search");
        assert_eq!(breaker.config().failure_threshold, 7);
        assert_eq!(breaker.config().recovery_timeout, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_starts_fresh() {
        let registry = CircuitBreakerRegistry::default();
        let breaker = registry.get_or_create(
            "search",
            CircuitBreakerOptions::default().failure_threshold(1),
        );
        trip(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(registry.remove("search"));
        assert!(!registry.remove("search"));
        assert!(registry.get("search").is_none());

        let fresh = registry.get_or_default("search");
        assert!(!Arc::ptr_eq(&breaker, &fresh));
        assert_eq!(fresh.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_stats_and_reset_all() {
        let registry = CircuitBreakerRegistry::default();
        for name in ["b", "a", "c"] {
            let breaker =
                registry.get_or_create(name, CircuitBreakerOptions::default().failure_threshold(1));
            trip(&breaker).await;
        }

        let stats = registry.all_stats();
        let names: Vec<_> = stats.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(stats.iter().all(|s| s.state == CircuitState::Open));

        registry.reset_all();
        assert!(registry
            .all_stats()
            .iter()
            .all(|s| s.state == CircuitState::Closed && s.total_requests == 0));
        assert_eq!(registry.names(), ["a", "b", "c"]);
    }
}
