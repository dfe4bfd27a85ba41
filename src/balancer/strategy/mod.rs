//! Instance selection strategies.
//!
//! A strategy only picks; the caller has already narrowed the list down to
//! instances that are healthy and below their connection limit, and claims
//! the connection slot itself.

mod fastest;
mod least_conn;
mod round_robin;
mod weighted;

pub use fastest::FastestResponse;
pub use least_conn::LeastConnections;
pub use round_robin::RoundRobin;
pub use weighted::WeightedRoundRobin;

use crate::balancer::ServiceInstance;
use crate::config::StrategyKind;
use crate::util::RequestId;
use std::sync::Arc;

/// Per-request information passed through to the strategy.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Correlates selection, breaker and client logs for one call.
    pub request_id: RequestId,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Trait for instance selection strategies.
pub trait SelectionStrategy: Send + Sync {
    /// Select an instance from `instances`, ordered by registration.
    ///
    /// Returns `None` if the list is empty.
    fn select(
        &self,
        instances: &[Arc<ServiceInstance>],
        context: Option<&RequestContext>,
    ) -> Option<Arc<ServiceInstance>>;

    /// Configuration key of this strategy.
    fn name(&self) -> &'static str;
}

/// Build the strategy configured by `kind`.
pub fn from_kind(kind: StrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
        StrategyKind::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
        StrategyKind::LeastConnections => Box::new(LeastConnections),
        StrategyKind::FastestResponse => Box::new(FastestResponse),
    }
}

#[cfg(test)]
pub(crate) fn test_instances(weights: &[u32]) -> Vec<Arc<ServiceInstance>> {
    use crate::config::InstanceConfig;

    weights
        .iter()
        .enumerate()
        .map(|(i, weight)| {
            let config = InstanceConfig::new(format!("i{}", i + 1), "127.0.0.1", 8001 + i as u16)
                .with_weight(*weight);
            Arc::new(ServiceInstance::new(&config))
        })
        .collect()
}
