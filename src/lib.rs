//! fleetguard - resilience primitives for a fleet of service instances
//!
//! This crate provides:
//! - Circuit breakers with a shared registry
//! - Instance pools with pluggable selection strategies
//! - Active HTTP health checking
//! - Threshold-based scaling recommendations
//! - Hot configuration reload and Prometheus metrics

pub mod balancer;
pub mod breaker;
pub mod client;
pub mod config;
pub mod events;
pub mod health;
pub mod metrics;
pub mod scaling;
pub mod state;
pub mod util;

pub use balancer::{LoadBalancer, LoadBalancerRegistry, RequestContext, ServiceInstance};
pub use breaker::{BreakerError, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use client::{CallError, ServiceClient};
pub use config::Config;
pub use events::{EventBus, ResilienceEvent};
pub use scaling::{ScalingEvent, ScalingMetrics};
