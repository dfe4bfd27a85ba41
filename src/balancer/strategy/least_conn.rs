//! Least-connections selection.

use super::{RequestContext, SelectionStrategy};
use crate::balancer::ServiceInstance;
use std::sync::Arc;

/// Least-connections strategy.
///
/// Picks the instance with the fewest active connections. Ties go to the
/// earliest registered instance.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn select(
        &self,
        instances: &[Arc<ServiceInstance>],
        _context: Option<&RequestContext>,
    ) -> Option<Arc<ServiceInstance>> {
        let mut min_conns = u32::MAX;
        let mut selected = None;

        for instance in instances {
            let conns = instance.active_connections();
            if selected.is_none() || conns < min_conns {
                min_conns = conns;
                selected = Some(instance);
            }
        }

        selected.map(Arc::clone)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::strategy::test_instances;

    #[test]
    fn test_least_conn_selects_lowest() {
        let instances = test_instances(&[1, 1, 1]);
        instances[0].try_acquire();
        instances[0].try_acquire();
        instances[1].try_acquire();

        let selected = LeastConnections.select(&instances, None).unwrap();
        assert_eq!(selected.id(), "i3");
    }

    #[test]
    fn test_least_conn_tie_goes_to_first() {
        let instances = test_instances(&[1, 1, 1]);
        instances[0].try_acquire();

        let selected = LeastConnections.select(&instances, None).unwrap();
        assert_eq!(selected.id(), "i2");
    }

    #[test]
    fn test_least_conn_empty() {
        assert!(LeastConnections.select(&[], None).is_none());
    }
}
