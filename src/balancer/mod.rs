//! Instance pools and selection.

mod instance;
mod pool;
mod registry;
pub mod strategy;

pub use instance::{InstanceStats, ServiceInstance};
pub use pool::{InstanceLease, LoadBalancer, LoadBalancerStats, SharedInstances};
pub use registry::{HealthReport, HealthStatus, LoadBalancerRegistry, ServiceHealth};
pub use strategy::{RequestContext, SelectionStrategy};
