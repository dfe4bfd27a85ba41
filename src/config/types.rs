//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Default health check settings
    #[serde(default)]
    pub health_check_defaults: HealthCheckDefaults,

    /// Default circuit breaker settings
    #[serde(default)]
    pub circuit_breaker_defaults: CircuitBreakerConfig,

    /// Service pools to balance across
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Default health check settings, used for any field a service leaves unset.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckDefaults {
    /// How often to probe instances
    #[serde(default = "default_health_interval", with = "duration_str")]
    pub interval: Duration,

    /// Timeout for the whole probe exchange
    #[serde(default = "default_health_timeout", with = "duration_str")]
    pub timeout: Duration,

    /// HTTP path to probe
    #[serde(default = "default_health_endpoint")]
    pub endpoint: String,

    /// Expected HTTP status code
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

impl Default for HealthCheckDefaults {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            endpoint: default_health_endpoint(),
            expected_status: default_expected_status(),
        }
    }
}

impl HealthCheckDefaults {
    /// Merge a service's health check overrides with these defaults.
    pub fn resolve(&self, check: &HealthCheckConfig) -> ProbeSettings {
        ProbeSettings {
            endpoint: check
                .endpoint
                .clone()
                .unwrap_or_else(|| self.endpoint.clone()),
            interval: check.interval.unwrap_or(self.interval),
            timeout: check.timeout.unwrap_or(self.timeout),
            expected_status: check.expected_status.unwrap_or(self.expected_status),
            expected_body: check.expected_body.clone(),
        }
    }
}

/// Fully resolved health probe settings for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    pub endpoint: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub expected_status: u16,
    pub expected_body: Option<String>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        HealthCheckDefaults::default().resolve(&HealthCheckConfig::default())
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures in the closed state before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls before probing
    #[serde(default = "default_recovery_timeout", with = "duration_str")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

/// A pool of interchangeable instances for one logical service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Unique service name (also the name of its circuit breaker)
    pub name: String,

    /// Instance selection strategy
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Per-call timeout applied by the service client
    #[serde(default, with = "duration_str::option")]
    pub call_timeout: Option<Duration>,

    /// Circuit breaker override for this service
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Active health checking; absent means instances are never probed
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    /// Instances registered at startup
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    /// Scaling rules evaluated against recorded metrics
    #[serde(default)]
    pub scaling_rules: Vec<ScalingRule>,
}

/// Instance selection strategy.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    FastestResponse,
}

/// Registration data for a single service instance.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Identity, unique within the service
    pub id: String,

    /// Hostname or IP address
    pub host: String,

    /// Port
    pub port: u16,

    /// Relative weight for weighted round-robin (default: 1)
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Concurrent connection cap (default: 100)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Free-form labels
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InstanceConfig {
    /// Create an instance registration with default weight and capacity.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: default_weight(),
            max_connections: default_max_connections(),
            metadata: HashMap::new(),
        }
    }

    /// Set the weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the connection cap.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Add a metadata label.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Per-service health check overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// HTTP path to probe
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Override interval for this service
    #[serde(default, with = "duration_str::option")]
    pub interval: Option<Duration>,

    /// Override timeout for this service
    #[serde(default, with = "duration_str::option")]
    pub timeout: Option<Duration>,

    /// Expected HTTP status code
    #[serde(default)]
    pub expected_status: Option<u16>,

    /// Substring the response body must contain
    #[serde(default)]
    pub expected_body: Option<String>,
}

/// Threshold-based scaling policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ScalingRule {
    /// Rule name
    pub name: String,

    /// Metric the threshold applies to
    pub metric: MetricKey,

    /// Threshold value
    pub threshold: f64,

    /// Recommended action when the rule fires
    pub action: ScalingAction,

    /// Minimum time between scaling actions
    #[serde(default = "default_scaling_cooldown", with = "duration_str")]
    pub cooldown: Duration,

    /// Lower bound on instance count for scale-down
    #[serde(default = "default_min_instances")]
    pub min_instances: u32,

    /// Upper bound on instance count for scale-up
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
}

/// Metric keys a scaling rule can target.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    CpuUsage,
    MemoryUsage,
    ActiveConnections,
    RequestsPerSecond,
    AvgResponseTime,
    ErrorRate,
}

impl MetricKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKey::CpuUsage => "cpu_usage",
            MetricKey::MemoryUsage => "memory_usage",
            MetricKey::ActiveConnections => "active_connections",
            MetricKey::RequestsPerSecond => "requests_per_second",
            MetricKey::AvgResponseTime => "avg_response_time",
            MetricKey::ErrorRate => "error_rate",
        }
    }
}

/// Scaling direction.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
}

impl ScalingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingAction::ScaleUp => "scale_up",
            ScalingAction::ScaleDown => "scale_down",
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

fn default_expected_status() -> u16 {
    200
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    100
}

fn default_scaling_cooldown() -> Duration {
    Duration::from_secs(300)
}

fn default_min_instances() -> u32 {
    1
}

fn default_max_instances() -> u32 {
    10
}

/// Durations written as humantime strings, e.g. `"30s"` or `"5m"`.
mod duration_str {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    fn parse<E: de::Error>(text: &str) -> Result<Duration, E> {
        humantime::parse_duration(text).map_err(E::custom)
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        parse(&String::deserialize(deserializer)?)
    }

    /// Same, for optional fields.
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(d) => serializer.collect_str(&humantime::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|text| parse(&text))
                .transpose()
        }
    }
}
