//! Round-robin selection.

use super::{RequestContext, SelectionStrategy};
use crate::balancer::ServiceInstance;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin strategy.
///
/// Cycles a cursor over whatever list it is given. The cursor is positional,
/// so when the eligible list changes between calls the next pick follows the
/// new list's order.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobin {
    fn select(
        &self,
        instances: &[Arc<ServiceInstance>],
        _context: Option<&RequestContext>,
    ) -> Option<Arc<ServiceInstance>> {
        if instances.is_empty() {
            return None;
        }

        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % instances.len();
        Some(Arc::clone(&instances[idx]))
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
