//! Active health checker.
//!
//! Periodically probes every instance of one service and flips its health
//! flag to match the probe result.

use crate::balancer::{ServiceInstance, SharedInstances};
use crate::config::ProbeSettings;
use crate::events::{EventBus, ResilienceEvent};
use crate::health::probe::probe;
use crate::metrics::MetricsCollector;
use crate::util::ShutdownSignal;
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Result of one pass over all instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckSummary {
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Active health checker for the instances of one service.
pub struct HealthChecker {
    service: String,
    instances: SharedInstances,
    settings: ProbeSettings,
    events: Option<EventBus>,
    metrics: Option<MetricsCollector>,
    /// Set while a pass is running.
    checking: AtomicBool,
}

impl HealthChecker {
    /// Create a new health checker.
    pub fn new(service: impl Into<String>, instances: SharedInstances, settings: ProbeSettings) -> Self {
        Self {
            service: service.into(),
            instances,
            settings,
            events: None,
            metrics: None,
            checking: AtomicBool::new(false),
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

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Probe every instance concurrently.
    ///
    /// Returns `None` without probing if another pass is still running.
    pub async fn check_all(&self) -> Option<CheckSummary> {
        if self
            .checking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(service = %self.service, "health check pass already running, skipping");
            return None;
        }
        let _pass = PassGuard(&self.checking);

        let instances: Vec<Arc<ServiceInstance>> = self.instances.read().clone();
        let results = join_all(instances.iter().map(|instance| self.check_instance(instance))).await;

        let healthy = results.iter().filter(|healthy| **healthy).count();
        Some(CheckSummary {
            healthy,
            unhealthy: results.len() - healthy,
        })
    }

    /// Probe one instance and apply the result.
    async fn check_instance(&self, instance: &ServiceInstance) -> bool {
        let result = probe(instance.host(), instance.port(), &self.settings).await;
        instance.mark_checked();

        let healthy = result.is_ok();
        let was_healthy = instance.set_healthy(healthy);

        if let Some(metrics) = &self.metrics {
            metrics.record_health_check(&self.service, instance.id(), healthy);
            metrics.set_instance_health(&self.service, instance.id(), healthy);
        }

        if was_healthy == healthy {
            if let Err(e) = &result {
                debug!(service = %self.service, instance = %instance.id(), error = %e, "health check failed");
            }
            return healthy;
        }

        match &result {
            Ok(()) => info!(
                service = %self.service,
                instance = %instance.id(),
                address = %instance.address(),
                "instance is healthy again"
            ),
            Err(e) => warn!(
                service = %self.service,
                instance = %instance.id(),
                address = %instance.address(),
                error = %e,
                "instance marked unhealthy"
            ),
        }

        if let Some(events) = &self.events {
            events.publish(ResilienceEvent::InstanceHealthChanged {
                service: self.service.clone(),
                instance: instance.id().to_string(),
                healthy,
            });
        }

        healthy
    }

    /// Check on every tick until `shutdown` fires.
    ///
    /// The first pass starts immediately. A pass finishes before the next
    /// tick is taken; ticks missed meanwhile are skipped.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            service = %self.service,
            interval = ?self.settings.interval,
            endpoint = %self.settings.endpoint,
            "health checker starting"
        );

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(summary) = self.check_all().await {
                        debug!(
                            service = %self.service,
                            healthy = summary.healthy,
                            unhealthy = summary.unhealthy,
                            "health check pass complete"
                        );
                    }
                }

                _ = shutdown.recv() => {
                    info!(service = %self.service, "health checker shutting down");
                    break;
                }
            }
        }
    }

    /// Run the checker on a background task.
    pub fn spawn(self: Arc<Self>) -> HealthCheckHandle {
        let signal = ShutdownSignal::new();
        let task = tokio::spawn(self.run(signal.subscribe()));
        HealthCheckHandle { signal, task }
    }
}

/// Clears the in-progress flag even if the pass is cancelled.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owner of a running health check task.
pub struct HealthCheckHandle {
    signal: ShutdownSignal,
    task: JoinHandle<()>,
}

impl HealthCheckHandle {
    /// Signal the task and wait for it to exit.
    pub async fn stop(self) {
        self.signal.shutdown();
        if let Err(e) = self.task.await {
            warn!(error = %e, "health check task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use parking_lot::RwLock;
    use std::sync::atomic::AtomicU16;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// HTTP stub answering with whatever status `status` currently holds.
    async fn switchable_stub(status: Arc<AtomicU16>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let status = status.load(Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response =
                        format!("HTTP/1.1 {status} Status\r\nContent-Length: 0\r\n\r\n");
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn shared(ports: &[u16]) -> SharedInstances {
        let instances = ports
            .iter()
            .enumerate()
            .map(|(i, port)| {
                Arc::new(ServiceInstance::new(&InstanceConfig::new(
                    format!("i{}", i + 1),
                    "127.0.0.1",
                    *port,
                )))
            })
            .collect();
        Arc::new(RwLock::new(instances))
    }

    fn settings(interval: Duration) -> ProbeSettings {
        ProbeSettings {
            interval,
            timeout: Duration::from_secs(1),
            ..ProbeSettings::default()
        }
    }

    #[tokio::test]
    async fn test_check_all_isolates_failures() {
        let status = Arc::new(AtomicU16::new(200));
        let up = switchable_stub(status).await;
        let down = closed_port().await;
        let instances = shared(&[up, down]);

        let checker = HealthChecker::new("api", Arc::clone(&instances), settings(Duration::from_secs(30)));
        let summary = checker.check_all().await.unwrap();

        assert_eq!(summary, CheckSummary { healthy: 1, unhealthy: 1 });
        let list = instances.read();
        assert!(list[0].is_healthy());
        assert!(!list[1].is_healthy());
        assert!(list[1].last_health_check().is_some());
    }

    #[tokio::test]
    async fn test_flips_are_published_once() {
        let status = Arc::new(AtomicU16::new(500));
        let port = switchable_stub(Arc::clone(&status)).await;
        let instances = shared(&[port]);
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let checker = HealthChecker::new("api", Arc::clone(&instances), settings(Duration::from_secs(30)))
            .with_events(bus);

        checker.check_all().await;
        checker.check_all().await;
        assert_eq!(
            rx.try_recv().unwrap(),
            ResilienceEvent::InstanceHealthChanged {
                service: "api".to_string(),
                instance: "i1".to_string(),
                healthy: false,
            }
        );
        assert!(rx.try_recv().is_err());

        status.store(200, Ordering::SeqCst);
        checker.check_all().await;
        assert!(instances.read()[0].is_healthy());
        assert!(matches!(
            rx.try_recv().unwrap(),
            ResilienceEvent::InstanceHealthChanged { healthy: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_skipped() {
        let instances = shared(&[closed_port().await]);
        let checker = HealthChecker::new("api", instances, settings(Duration::from_secs(30)));

        checker.checking.store(true, Ordering::SeqCst);
        assert!(checker.check_all().await.is_none());

        checker.checking.store(false, Ordering::SeqCst);
        assert!(checker.check_all().await.is_some());
    }

    #[tokio::test]
    async fn test_spawned_checker_runs_and_stops() {
        let status = Arc::new(AtomicU16::new(503));
        let port = switchable_stub(Arc::clone(&status)).await;
        let instances = shared(&[port]);

        let checker = Arc::new(HealthChecker::new(
            "api",
            Arc::clone(&instances),
            settings(Duration::from_millis(20)),
        ));
        let handle = checker.spawn();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!instances.read()[0].is_healthy());

        status.store(200, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(instances.read()[0].is_healthy());

        handle.stop().await;
    }
}
