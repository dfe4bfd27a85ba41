//! Load balancer over the instances of one service.

use crate::balancer::strategy::{self, RequestContext, SelectionStrategy};
use crate::balancer::{InstanceStats, ServiceInstance};
use crate::config::{InstanceConfig, ProbeSettings, ScalingRule, StrategyKind};
use crate::events::EventBus;
use crate::health::{HealthCheckHandle, HealthChecker};
use crate::metrics::MetricsCollector;
use crate::scaling::{ScalingEvaluator, ScalingEvent, ScalingMetrics};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Instance list shared between a balancer and its health checker.
pub type SharedInstances = Arc<RwLock<Vec<Arc<ServiceInstance>>>>;

/// How often selection is retried when the picked instance filled up
/// between filtering and claiming its slot.
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Aggregate view of a balancer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadBalancerStats {
    pub service: String,
    pub strategy: &'static str,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub active_connections: u64,
    /// Mean of the instances' smoothed response times.
    pub average_response_time_ms: f64,
    pub health_checks_running: bool,
    pub instances: Vec<InstanceStats>,
}

/// Distributes calls for one service across its registered instances.
pub struct LoadBalancer {
    service: String,
    strategy_kind: StrategyKind,
    strategy: Box<dyn SelectionStrategy>,
    instances: SharedInstances,
    scaling: ScalingEvaluator,
    probe: Option<ProbeSettings>,
    events: Option<EventBus>,
    metrics: Option<MetricsCollector>,
    health_task: Mutex<Option<HealthCheckHandle>>,
}

impl LoadBalancer {
    pub fn new(service: impl Into<String>, strategy: StrategyKind) -> Self {
        let service = service.into();
        Self {
            scaling: ScalingEvaluator::new(service.clone(), Vec::new()),
            service,
            strategy_kind: strategy,
            strategy: strategy::from_kind(strategy),
            instances: Arc::new(RwLock::new(Vec::new())),
            probe: None,
            events: None,
            metrics: None,
            health_task: Mutex::new(None),
        }
    }

    /// Enable active health checks with `settings`.
    pub fn with_health_check(mut self, settings: ProbeSettings) -> Self {
        self.probe = Some(settings);
        self
    }

    pub fn with_scaling_rules(self, rules: Vec<ScalingRule>) -> Self {
        self.scaling.set_rules(rules);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.scaling = self.scaling.with_events(events.clone());
        self.events = Some(events);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.scaling = self.scaling.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy_kind
    }

    pub fn probe_settings(&self) -> Option<&ProbeSettings> {
        self.probe.as_ref()
    }

    /// Register an instance, healthy and idle.
    ///
    /// An instance with the same id is replaced where it stands.
    pub fn register_instance(&self, config: InstanceConfig) -> Arc<ServiceInstance> {
        let instance = Arc::new(ServiceInstance::new(&config));

        let replaced = {
            let mut instances = self.instances.write();
            match instances.iter_mut().find(|i| i.id() == config.id) {
                Some(slot) => {
                    *slot = Arc::clone(&instance);
                    true
                }
                None => {
                    instances.push(Arc::clone(&instance));
                    false
                }
            }
        };

        info!(
            service = %self.service,
            instance = %config.id,
            address = %instance.address(),
            weight = config.weight,
            max_connections = config.max_connections,
            replaced,
            "instance registered"
        );

        if let Some(metrics) = &self.metrics {
            metrics.set_instance_health(&self.service, instance.id(), true);
            metrics.set_active_connections(&self.service, instance.id(), 0);
        }

        instance
    }

    /// Remove an instance. Leases still held on it stay valid.
    pub fn unregister_instance(&self, id: &str) -> Option<Arc<ServiceInstance>> {
        let removed = {
            let mut instances = self.instances.write();
            let idx = instances.iter().position(|i| i.id() == id)?;
            instances.remove(idx)
        };

        info!(
            service = %self.service,
            instance = %id,
            active_connections = removed.active_connections(),
            "instance unregistered"
        );

        if let Some(metrics) = &self.metrics {
            metrics.remove_instance(&self.service, id);
        }

        Some(removed)
    }

    pub fn instance(&self, id: &str) -> Option<Arc<ServiceInstance>> {
        self.instances.read().iter().find(|i| i.id() == id).cloned()
    }

    /// All instances in registration order.
    pub fn instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.instances.read().clone()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Select an instance and claim one of its connection slots.
    ///
    /// Only healthy instances below their connection limit are offered to
    /// the strategy. Returns `None` when no instance qualifies. The caller
    /// must hand the slot back with [`release_instance`](Self::release_instance),
    /// or use [`acquire`](Self::acquire) instead.
    pub fn get_next_instance(&self, context: Option<&RequestContext>) -> Option<Arc<ServiceInstance>> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let eligible: Vec<_> = self
                .instances
                .read()
                .iter()
                .filter(|i| i.is_available())
                .cloned()
                .collect();

            let Some(selected) = self.strategy.select(&eligible, context) else {
                debug!(service = %self.service, "no eligible instance");
                return None;
            };

            // Another caller may have taken the last slot since filtering.
            if selected.try_acquire() {
                let active = selected.active_connections();
                debug!(
                    service = %self.service,
                    instance = %selected.id(),
                    active_connections = active,
                    request_id = context.map(|c| c.request_id.as_str()),
                    "instance selected"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.set_active_connections(&self.service, selected.id(), active);
                }
                return Some(selected);
            }
        }

        debug!(service = %self.service, "instances filled up during selection");
        None
    }

    /// Select an instance and hold its slot until the lease is dropped.
    pub fn acquire(&self, context: Option<&RequestContext>) -> Option<InstanceLease<'_>> {
        self.get_next_instance(context).map(|instance| InstanceLease {
            balancer: self,
            instance,
        })
    }

    /// Hand back a connection slot taken by `get_next_instance`.
    pub fn release_instance(&self, id: &str) {
        match self.instance(id) {
            Some(instance) => self.release(&instance),
            None => debug!(service = %self.service, instance = %id, "release for unknown instance"),
        }
    }

    fn release(&self, instance: &Arc<ServiceInstance>) {
        let active = instance.release();

        // The gauge series belongs to whichever instance is registered under
        // this id now; a stale lease must not recreate or overwrite it.
        let registered = self
            .instance(instance.id())
            .is_some_and(|current| Arc::ptr_eq(&current, instance));
        if registered && let Some(metrics) = &self.metrics {
            metrics.set_active_connections(&self.service, instance.id(), active);
        }
    }

    /// Fold a call's response time into the instance's moving average.
    ///
    /// `success` is only logged; health is decided by the health checker.
    pub fn update_instance_metrics(&self, id: &str, response_time: Duration, success: bool) {
        let Some(instance) = self.instance(id) else {
            debug!(service = %self.service, instance = %id, "metrics for unknown instance");
            return;
        };

        let smoothed = instance.record_response_time(response_time);
        debug!(
            service = %self.service,
            instance = %id,
            response_time_ms = response_time.as_secs_f64() * 1000.0,
            smoothed_ms = smoothed,
            success,
            "instance metrics updated"
        );
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let instances: Vec<InstanceStats> = self.instances.read().iter().map(|i| i.snapshot()).collect();

        let healthy_instances = instances.iter().filter(|i| i.healthy).count();
        let active_connections = instances
            .iter()
            .map(|i| u64::from(i.active_connections))
            .sum();
        let average_response_time_ms = if instances.is_empty() {
            0.0
        } else {
            instances.iter().map(|i| i.response_time_ms).sum::<f64>() / instances.len() as f64
        };

        LoadBalancerStats {
            service: self.service.clone(),
            strategy: self.strategy.name(),
            total_instances: instances.len(),
            healthy_instances,
            active_connections,
            average_response_time_ms,
            health_checks_running: self.health_checks_running(),
            instances,
        }
    }

    /// Record a metrics sample and evaluate the scaling rules against it.
    pub fn record_metrics(&self, sample: ScalingMetrics) -> Vec<ScalingEvent> {
        self.scaling.record(sample, self.instance_count())
    }

    pub fn set_scaling_rules(&self, rules: Vec<ScalingRule>) {
        info!(service = %self.service, rules = rules.len(), "scaling rules updated");
        self.scaling.set_rules(rules);
    }

    pub fn scaling_rules(&self) -> Vec<ScalingRule> {
        self.scaling.rules()
    }

    /// Recorded metrics samples, oldest first.
    pub fn metrics_history(&self) -> Vec<ScalingMetrics> {
        self.scaling.history()
    }

    /// Start the periodic health check task.
    ///
    /// Returns `false` if health checking is not configured, has a zero
    /// interval, or is already running. Must be called within a tokio runtime.
    pub fn start_health_checks(&self) -> bool {
        let Some(settings) = self.probe.clone() else {
            warn!(service = %self.service, "no health check configured");
            return false;
        };
        if settings.interval.is_zero() {
            warn!(service = %self.service, "health check interval is zero, not starting");
            return false;
        }

        let mut task = self.health_task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let mut checker = HealthChecker::new(self.service.clone(), Arc::clone(&self.instances), settings);
        if let Some(events) = &self.events {
            checker = checker.with_events(events.clone());
        }
        if let Some(metrics) = &self.metrics {
            checker = checker.with_metrics(metrics.clone());
        }

        *task = Some(Arc::new(checker).spawn());
        true
    }

    /// Stop the health check task and wait for it to exit.
    pub async fn stop_health_checks(&self) {
        let handle = self.health_task.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
            info!(service = %self.service, "health checks stopped");
        }
    }

    pub fn health_checks_running(&self) -> bool {
        self.health_task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("service", &self.service)
            .field("strategy", &self.strategy.name())
            .field("instances", &self.instance_count())
            .finish()
    }
}

/// A claimed connection slot, released on drop.
pub struct InstanceLease<'a> {
    balancer: &'a LoadBalancer,
    instance: Arc<ServiceInstance>,
}

impl InstanceLease<'_> {
    pub fn instance(&self) -> &Arc<ServiceInstance> {
        &self.instance
    }

    /// Report the outcome of the call made on this lease.
    pub fn report(&self, response_time: Duration, success: bool) {
        let smoothed = self.instance.record_response_time(response_time);
        debug!(
            service = %self.balancer.service,
            instance = %self.instance.id(),
            smoothed_ms = smoothed,
            success,
            "instance metrics updated"
        );
    }
}

impl std::ops::Deref for InstanceLease<'_> {
    type Target = ServiceInstance;

    fn deref(&self) -> &ServiceInstance {
        &self.instance
    }
}

impl Drop for InstanceLease<'_> {
    fn drop(&mut self) {
        // Release on the instance itself; it may have been unregistered.
        self.balancer.release(&self.instance);
    }
}
