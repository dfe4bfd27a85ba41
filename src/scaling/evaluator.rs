//! Scaling rule evaluation.

use crate::config::{MetricKey, ScalingAction, ScalingRule};
use crate::events::{EventBus, ResilienceEvent};
use crate::metrics::MetricsCollector;
use crate::scaling::ScalingMetrics;
use crate::util::unix_millis;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Number of samples retained per service.
pub const METRICS_HISTORY: usize = 100;

/// A scaling recommendation produced by a rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingEvent {
    pub id: Uuid,
    pub service: String,
    pub rule: String,
    pub action: ScalingAction,
    pub metric: MetricKey,
    /// Observed metric value that crossed the threshold.
    pub value: f64,
    pub threshold: f64,
    pub current_instances: usize,
    pub timestamp_ms: u64,
}

/// Evaluates a service's scaling rules against recorded samples.
///
/// All rules share one cooldown clock: once any rule triggers, no rule
/// triggers again until its own `cooldown` has elapsed since that action.
pub struct ScalingEvaluator {
    service: String,
    rules: RwLock<Vec<ScalingRule>>,
    state: Mutex<EvaluatorState>,
    events: Option<EventBus>,
    metrics: Option<MetricsCollector>,
}

struct EvaluatorState {
    history: VecDeque<ScalingMetrics>,
    last_action: Option<Instant>,
}

impl ScalingEvaluator {
    pub fn new(service: impl Into<String>, rules: Vec<ScalingRule>) -> Self {
        Self {
            service: service.into(),
            rules: RwLock::new(rules),
            state: Mutex::new(EvaluatorState {
                history: VecDeque::with_capacity(METRICS_HISTORY),
                last_action: None,
            }),
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

    pub fn rules(&self) -> Vec<ScalingRule> {
        self.rules.read().clone()
    }

    /// Replace the rule set. The cooldown clock is kept.
    pub fn set_rules(&self, rules: Vec<ScalingRule>) {
        *self.rules.write() = rules;
    }

    /// Recorded samples, oldest first.
    pub fn history(&self) -> Vec<ScalingMetrics> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Store `sample` and evaluate every rule against it.
    ///
    /// Returns the recommendations triggered by this sample, in rule order.
    pub fn record(&self, sample: ScalingMetrics, current_instances: usize) -> Vec<ScalingEvent> {
        let now = Instant::now();
        let rules = self.rules.read();
        let mut triggered = Vec::new();

        {
            let mut state = self.state.lock();
            if state.history.len() == METRICS_HISTORY {
                state.history.pop_front();
            }
            state.history.push_back(sample.clone());

            for rule in rules.iter() {
                let value = sample.value(rule.metric);
                if !fires(rule, value) || !actionable(rule, current_instances) {
                    continue;
                }

                if let Some(last) = state.last_action {
                    let since = now.saturating_duration_since(last);
                    if since < rule.cooldown {
                        debug!(
                            service = %self.service,
                            rule = %rule.name,
                            remaining = ?(rule.cooldown - since),
                            "scaling rule in cooldown"
                        );
                        continue;
                    }
                }

                state.last_action = Some(now);
                triggered.push(ScalingEvent {
                    id: Uuid::new_v4(),
                    service: self.service.clone(),
                    rule: rule.name.clone(),
                    action: rule.action,
                    metric: rule.metric,
                    value,
                    threshold: rule.threshold,
                    current_instances,
                    timestamp_ms: unix_millis(),
                });
            }
        }
        drop(rules);

        for event in &triggered {
            info!(
                service = %event.service,
                rule = %event.rule,
                action = event.action.as_str(),
                metric = event.metric.as_str(),
                value = event.value,
                threshold = event.threshold,
                current_instances = event.current_instances,
                "scaling recommended"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_scaling_recommendation(&event.service, &event.rule, event.action);
            }
            if let Some(events) = &self.events {
                events.publish(ResilienceEvent::ScalingRecommended(event.clone()));
            }
        }

        triggered
    }
}

fn fires(rule: &ScalingRule, value: f64) -> bool {
    match rule.action {
        ScalingAction::ScaleUp => value > rule.threshold,
        ScalingAction::ScaleDown => value < rule.threshold,
    }
}

fn actionable(rule: &ScalingRule, current_instances: usize) -> bool {
    let current = u64::try_from(current_instances).unwrap_or(u64::MAX);
    match rule.action {
        ScalingAction::ScaleUp => current < u64::from(rule.max_instances),
        ScalingAction::ScaleDown => current > u64::from(rule.min_instances),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rule(name: &str, metric: MetricKey, threshold: f64, action: ScalingAction) -> ScalingRule {
        ScalingRule {
            name: name.to_string(),
            metric,
            threshold,
            action,
            cooldown: Duration::from_secs(300),
            min_instances: 1,
            max_instances: 5,
        }
    }

    fn cpu(value: f64) -> ScalingMetrics {
        ScalingMetrics::new().with(MetricKey::CpuUsage, value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_fires_once_per_cooldown() {
        let evaluator = ScalingEvaluator::new(
            "api",
            vec![rule("cpu-high", MetricKey::CpuUsage, 80.0, ScalingAction::ScaleUp)],
        );

        let events = evaluator.record(cpu(85.0), 2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule, "cpu-high");
        assert_eq!(events[0].value, 85.0);
        assert_eq!(events[0].current_instances, 2);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(evaluator.record(cpu(95.0), 2).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(evaluator.record(cpu(95.0), 2).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_is_exclusive() {
        let evaluator = ScalingEvaluator::new(
            "api",
            vec![rule("cpu-high", MetricKey::CpuUsage, 80.0, ScalingAction::ScaleUp)],
        );
        assert!(evaluator.record(cpu(80.0), 2).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounds_block_action() {
        let evaluator = ScalingEvaluator::new(
            "api",
            vec![
                rule("cpu-high", MetricKey::CpuUsage, 80.0, ScalingAction::ScaleUp),
                rule("cpu-low", MetricKey::CpuUsage, 20.0, ScalingAction::ScaleDown),
            ],
        );

        assert!(evaluator.record(cpu(90.0), 5).is_empty());
        assert!(evaluator.record(cpu(10.0), 1).is_empty());

        let events = evaluator.record(cpu(10.0), 2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, ScalingAction::ScaleDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_is_shared_between_rules() {
        let evaluator = ScalingEvaluator::new(
            "api",
            vec![
                rule("cpu-low", MetricKey::CpuUsage, 20.0, ScalingAction::ScaleDown),
                rule("errors", MetricKey::ErrorRate, 0.05, ScalingAction::ScaleUp),
            ],
        );

        assert_eq!(evaluator.record(cpu(10.0), 3).len(), 1);

        let noisy = cpu(50.0).with(MetricKey::ErrorRate, 0.5);
        assert!(evaluator.record(noisy, 3).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_capped() {
        let evaluator = ScalingEvaluator::new("api", Vec::new());
        for i in 0..(METRICS_HISTORY + 5) {
            evaluator.record(cpu(i as f64), 1);
        }

        let history = evaluator.history();
        assert_eq!(history.len(), METRICS_HISTORY);
        assert_eq!(history[0].cpu_usage, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recommendation_is_published() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let evaluator = ScalingEvaluator::new(
            "api",
            vec![rule("cpu-high", MetricKey::CpuUsage, 80.0, ScalingAction::ScaleUp)],
        )
        .with_events(bus);

        let events = evaluator.record(cpu(85.0), 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            ResilienceEvent::ScalingRecommended(events[0].clone())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rules_replaces() {
        let evaluator = ScalingEvaluator::new("api", Vec::new());
        assert!(evaluator.record(cpu(99.0), 1).is_empty());

        evaluator.set_rules(vec![rule("cpu-high", MetricKey::CpuUsage, 80.0, ScalingAction::ScaleUp)]);
        assert_eq!(evaluator.rules().len(), 1);
        assert_eq!(evaluator.record(cpu(99.0), 1).len(), 1);
    }
}
