//! Metric samples fed to the scaling evaluator.

use crate::config::MetricKey;
use crate::util::unix_millis;
use serde::{Deserialize, Serialize};

/// One externally supplied metrics sample for a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingMetrics {
    /// CPU usage in percent.
    #[serde(default)]
    pub cpu_usage: f64,
    /// Memory usage in percent.
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub active_connections: f64,
    #[serde(default)]
    pub requests_per_second: f64,
    /// Average response time in milliseconds.
    #[serde(default)]
    pub avg_response_time: f64,
    /// Fraction of failed requests, 0.0 to 1.0.
    #[serde(default)]
    pub error_rate: f64,
    /// Unix time the sample was taken, in milliseconds.
    #[serde(default = "unix_millis")]
    pub timestamp_ms: u64,
}

impl ScalingMetrics {
    /// An all-zero sample stamped with the current time.
    pub fn new() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            active_connections: 0.0,
            requests_per_second: 0.0,
            avg_response_time: 0.0,
            error_rate: 0.0,
            timestamp_ms: unix_millis(),
        }
    }

    pub fn with(mut self, key: MetricKey, value: f64) -> Self {
        match key {
            MetricKey::CpuUsage => self.cpu_usage = value,
            MetricKey::MemoryUsage => self.memory_usage = value,
            MetricKey::ActiveConnections => self.active_connections = value,
            MetricKey::RequestsPerSecond => self.requests_per_second = value,
            MetricKey::AvgResponseTime => self.avg_response_time = value,
            MetricKey::ErrorRate => self.error_rate = value,
        }
        self
    }

    /// Value of the metric a rule refers to.
    pub fn value(&self, key: MetricKey) -> f64 {
        match key {
            MetricKey::CpuUsage => self.cpu_usage,
            MetricKey::MemoryUsage => self.memory_usage,
            MetricKey::ActiveConnections => self.active_connections,
            MetricKey::RequestsPerSecond => self.requests_per_second,
            MetricKey::AvgResponseTime => self.avg_response_time,
            MetricKey::ErrorRate => self.error_rate,
        }
    }
}

impl Default for ScalingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_by_key() {
        let sample = ScalingMetrics::new()
            .with(MetricKey::CpuUsage, 85.0)
            .with(MetricKey::ErrorRate, 0.1);
        assert_eq!(sample.value(MetricKey::CpuUsage), 85.0);
        assert_eq!(sample.value(MetricKey::ErrorRate), 0.1);
        assert_eq!(sample.value(MetricKey::MemoryUsage), 0.0);
        assert!(sample.timestamp_ms > 0);
    }

    #[test]
    fn test_deserialize_partial_sample() {
        let sample: ScalingMetrics = serde_json::from_str(r#"{"cpu_usage": 42.5}"#).unwrap();
        assert_eq!(sample.cpu_usage, 42.5);
        assert_eq!(sample.requests_per_second, 0.0);
        assert!(sample.timestamp_ms > 0);
    }
}
