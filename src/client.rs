//! Guarded calls to a named service.
//!
//! Ties the pieces together the way callers are expected to use them: pick
//! an instance from the service's balancer, run the call through the
//! service's circuit breaker, feed the response time back and release the
//! instance, whatever the outcome.

use crate::balancer::{LoadBalancerRegistry, RequestContext, ServiceInstance};
use crate::breaker::{BreakerError, CircuitBreakerOptions, CircuitBreakerRegistry};
use crate::config::Config;
use crate::metrics::MetricsCollector;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Why a call through [`ServiceClient`] failed.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// No balancer is registered under this name.
    #[error("unknown service '{service}'")]
    UnknownService { service: String },

    /// Every instance is unhealthy or at its connection limit.
    #[error("no healthy instance available for service '{service}'")]
    NoHealthyInstance { service: String },

    /// The breaker rejected the call, it timed out, or it failed.
    #[error("{0}")]
    Breaker(BreakerError<E>),
}

impl<E> From<BreakerError<E>> for CallError<E> {
    fn from(err: BreakerError<E>) -> Self {
        CallError::Breaker(err)
    }
}

impl<E> CallError<E> {
    /// True when the call never reached an instance.
    pub fn is_unavailable(&self) -> bool {
        match self {
            CallError::UnknownService { .. } | CallError::NoHealthyInstance { .. } => true,
            CallError::Breaker(err) => err.is_open(),
        }
    }

    /// The operation's own error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            CallError::Breaker(err) => err.into_operation(),
            _ => None,
        }
    }
}

/// Makes guarded calls to services by name.
///
/// The breaker guarding a service is the one registered under the service's
/// name.
pub struct ServiceClient {
    balancers: Arc<LoadBalancerRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    call_timeouts: DashMap<String, Duration>,
    metrics: Option<MetricsCollector>,
}

impl ServiceClient {
    pub fn new(balancers: Arc<LoadBalancerRegistry>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            balancers,
            breakers,
            call_timeouts: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Apply per-service call timeouts and create breakers with their
    /// configured options.
    ///
    /// Breakers that already exist keep their options.
    pub fn configure(&self, config: &Config) {
        for service in &config.services {
            let breaker_config = service
                .circuit_breaker
                .clone()
                .unwrap_or_else(|| config.circuit_breaker_defaults.clone());
            self.breakers
                .get_or_create(&service.name, CircuitBreakerOptions::new(breaker_config));

            match service.call_timeout {
                Some(timeout) => {
                    self.call_timeouts.insert(service.name.clone(), timeout);
                }
                None => {
                    self.call_timeouts.remove(&service.name);
                }
            }
        }
    }

    /// Set the timeout applied to calls to `service`.
    pub fn set_call_timeout(&self, service: &str, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => {
                self.call_timeouts.insert(service.to_string(), timeout);
            }
            None => {
                self.call_timeouts.remove(service);
            }
        }
    }

    pub fn call_timeout(&self, service: &str) -> Option<Duration> {
        self.call_timeouts.get(service).map(|t| *t)
    }

    /// Call `service` on the instance its balancer selects.
    ///
    /// The instance's connection slot is held for the duration of the call
    /// and released on every path, including cancellation.
    pub async fn call<F, Fut, T, E>(
        &self,
        service: &str,
        context: Option<&RequestContext>,
        operation: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce(Arc<ServiceInstance>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let balancer = self
            .balancers
            .get(service)
            .ok_or_else(|| CallError::UnknownService {
                service: service.to_string(),
            })?;
        let breaker = self.breakers.get_or_default(service);

        let lease = balancer
            .acquire(context)
            .ok_or_else(|| CallError::NoHealthyInstance {
                service: service.to_string(),
            })?;
        let instance = Arc::clone(lease.instance());

        let started = Instant::now();
        let result = match self.call_timeout(service) {
            Some(timeout) => {
                breaker
                    .execute_with_timeout(|| operation(instance), timeout)
                    .await
            }
            None => breaker.execute(|| operation(instance)).await,
        };
        let elapsed = started.elapsed();

        // Rejected calls never reached the instance.
        if !matches!(result, Err(BreakerError::Open { .. })) {
            lease.report(elapsed, result.is_ok());
            if let Some(metrics) = &self.metrics {
                metrics.record_request(service, elapsed);
            }
        }

        debug!(
            service = %service,
            instance = %lease.id(),
            request_id = context.map(|c| c.request_id.as_str()),
            success = result.is_ok(),
            elapsed = ?elapsed,
            "service call finished"
        );

        result.map_err(CallError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::config::{parse_config, InstanceConfig, StrategyKind};

    #[derive(Debug, PartialEq)]
    struct Refused;

    fn client() -> ServiceClient {
        let balancers = Arc::new(LoadBalancerRegistry::new());
        let api = balancers.get_or_create("api", StrategyKind::RoundRobin);
        api.register_instance(InstanceConfig::new("api-1", "10.0.0.1", 8080));
        api.register_instance(InstanceConfig::new("api-2", "10.0.0.2", 8080));

        let breakers = Arc::new(CircuitBreakerRegistry::default());
        breakers.get_or_create("api", CircuitBreakerOptions::default().failure_threshold(2));

        ServiceClient::new(balancers, breakers)
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_runs_on_selected_instance_and_releases() {
        let client = client();

        let host = client
            .call("api", None, |instance| async move {
                tokio::time::sleep(Duration::from_millis(25)).await;
                assert_eq!(instance.active_connections(), 1);
                Ok::<_, Refused>(instance.host().to_string())
            })
            .await
            .unwrap();

        assert_eq!(host, "10.0.0.1");
        let api = client.balancers.get("api").unwrap();
        let instance = api.instance("api-1").unwrap();
        assert_eq!(instance.active_connections(), 0);
        assert!((instance.response_time_ms() - 25.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_service() {
        let client = client();
        let err = client
            .call("billing", None, |_| async { Ok::<_, Refused>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::UnknownService { ref service } if service == "billing"));
        assert!(err.is_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_healthy_instance() {
        let client = client();
        let api = client.balancers.get("api").unwrap();
        for instance in api.instances() {
            instance.set_healthy(false);
        }

        let err = client
            .call("api", None, |_| async { Ok::<_, Refused>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NoHealthyInstance { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_open_the_service_breaker() {
        let client = client();

        for _ in 0..2 {
            let err = client
                .call("api", None, |_| async { Err::<(), _>(Refused) })
                .await
                .unwrap_err();
            assert_eq!(err.into_operation(), Some(Refused));
        }

        let err = client
            .call("api", None, |_| async { Ok::<_, Refused>(()) })
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(client.breakers.get("api").unwrap().state(), CircuitState::Open);

        let api = client.balancers.get("api").unwrap();
        assert!(api.instances().iter().all(|i| i.active_connections() == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_from_config() {
        let config = parse_config(
            r#"
services:
  - name: api
    call_timeout: 50ms
    circuit_breaker: { failure_threshold: 1, recovery_timeout: 5s }
    instances:
      - { id: api-1, host: 10.0.0.1, port: 8080 }
"#,
        )
        .unwrap();

        let balancers = Arc::new(LoadBalancerRegistry::new());
        balancers.apply_config(&config).await;
        let client = ServiceClient::new(balancers, Arc::new(CircuitBreakerRegistry::default()));
        client.configure(&config);
        assert_eq!(client.call_timeout("api"), Some(Duration::from_millis(50)));

        let err = client
            .call("api", None, |_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, Refused>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Breaker(BreakerError::Timeout(_))));
        assert_eq!(client.breakers.get("api").unwrap().state(), CircuitState::Open);
    }
}
