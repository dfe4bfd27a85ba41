//! Fastest-response selection.

use super::{RequestContext, SelectionStrategy};
use crate::balancer::ServiceInstance;
use std::sync::Arc;

/// Fastest-response strategy.
///
/// Picks the instance with the lowest smoothed response time. Instances that
/// were never measured report 0 and therefore win until they are.
#[derive(Debug, Default)]
pub struct FastestResponse;

impl SelectionStrategy for FastestResponse {
    fn select(
        &self,
        instances: &[Arc<ServiceInstance>],
        _context: Option<&RequestContext>,
    ) -> Option<Arc<ServiceInstance>> {
        let mut fastest = f64::INFINITY;
        let mut selected = None;

        for instance in instances {
            let response_time = instance.response_time_ms();
            if selected.is_none() || response_time < fastest {
                fastest = response_time;
                selected = Some(instance);
            }
        }

        selected.map(Arc::clone)
    }

    fn name(&self) -> &'static str {
        "fastest_response"
    }
}
