//! Configuration validation.

use crate::config::{CircuitBreakerConfig, Config, ServiceConfig};
use std::collections::HashSet;
use std::time::Duration;

/// Validate the configuration.
///
/// Checks for:
/// - At least one service
/// - Unique, non-empty service names and instance ids
/// - Instance addresses, weights and connection caps
/// - Health check endpoints and scaling rule bounds
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.services.is_empty() {
        errors.push("at least one service must be defined".to_string());
    }

    let mut service_names = HashSet::new();
    for service in &config.services {
        if service.name.is_empty() {
            errors.push("service name cannot be empty".to_string());
        }

        if !service_names.insert(service.name.as_str()) {
            errors.push(format!("duplicate service name: {}", service.name));
        }

        validate_service(service, &mut errors);
    }

    validate_breaker("circuit_breaker_defaults", &config.circuit_breaker_defaults, &mut errors);

    validate_probe_timing(
        "health_check_defaults",
        Some(config.health_check_defaults.interval),
        Some(config.health_check_defaults.timeout),
        &mut errors,
    );

    if !config.health_check_defaults.endpoint.starts_with('/') {
        errors.push(format!(
            "default health check endpoint '{}' must start with '/'",
            config.health_check_defaults.endpoint
        ));
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// A zero interval cannot drive a ticker and a zero timeout fails every probe.
fn validate_probe_timing(
    scope: &str,
    interval: Option<Duration>,
    timeout: Option<Duration>,
    errors: &mut Vec<String>,
) {
    if interval.is_some_and(|d| d.is_zero()) {
        errors.push(format!("{scope}: interval must be greater than zero"));
    }
    if timeout.is_some_and(|d| d.is_zero()) {
        errors.push(format!("{scope}: timeout must be greater than zero"));
    }
}

fn validate_service(service: &ServiceConfig, errors: &mut Vec<String>) {
    let mut instance_ids = HashSet::new();

    for instance in &service.instances {
        if instance.id.is_empty() {
            errors.push(format!("service '{}' has an instance with empty id", service.name));
        }

        if !instance_ids.insert(instance.id.as_str()) {
            errors.push(format!(
                "duplicate instance id '{}' in service '{}'",
                instance.id, service.name
            ));
        }

        if instance.host.is_empty() {
            errors.push(format!(
                "instance '{}' in service '{}' has an empty host",
                instance.id, service.name
            ));
        }

        if instance.port == 0 {
            errors.push(format!(
                "instance '{}' in service '{}' has port 0",
                instance.id, service.name
            ));
        }

        if instance.weight == 0 {
            errors.push(format!(
                "instance '{}' in service '{}' has weight 0 (must be >= 1)",
                instance.id, service.name
            ));
        }

        if instance.max_connections == 0 {
            errors.push(format!(
                "instance '{}' in service '{}' has max_connections 0 (must be >= 1)",
                instance.id, service.name
            ));
        }
    }

    if let Some(ref breaker) = service.circuit_breaker {
        validate_breaker(&format!("service '{}'", service.name), breaker, errors);
    }

    if let Some(check) = &service.health_check {
        if let Some(endpoint) = check.endpoint.as_deref()
            && !endpoint.starts_with('/')
        {
            errors.push(format!(
                "service '{}' health check endpoint '{}' must start with '/'",
                service.name, endpoint
            ));
        }

        validate_probe_timing(
            &format!("service '{}' health_check", service.name),
            check.interval,
            check.timeout,
            errors,
        );
    }

    let mut rule_names = HashSet::new();
    for rule in &service.scaling_rules {
        if rule.name.is_empty() {
            errors.push(format!("service '{}' has a scaling rule with empty name", service.name));
        }

        if !rule_names.insert(rule.name.as_str()) {
            errors.push(format!(
                "duplicate scaling rule '{}' in service '{}'",
                rule.name, service.name
            ));
        }

        if !rule.threshold.is_finite() {
            errors.push(format!(
                "scaling rule '{}' in service '{}' has a non-finite threshold",
                rule.name, service.name
            ));
        }

        if rule.min_instances > rule.max_instances {
            errors.push(format!(
                "scaling rule '{}' in service '{}' has min_instances {} > max_instances {}",
                rule.name, service.name, rule.min_instances, rule.max_instances
            ));
        }
    }
}

fn validate_breaker(scope: &str, breaker: &CircuitBreakerConfig, errors: &mut Vec<String>) {
    if breaker.failure_threshold == 0 {
        errors.push(format!(
            "{scope}: circuit breaker failure_threshold must be >= 1"
        ));
    }
}
