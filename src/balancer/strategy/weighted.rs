//! Weighted round-robin selection.

use super::{RequestContext, SelectionStrategy};
use crate::balancer::ServiceInstance;
use parking_lot::Mutex;
use std::sync::Arc;

/// Weighted round-robin strategy.
///
/// Expands every instance into `weight` consecutive slots and cycles through
/// them. The slot table is rebuilt, and the cursor reset, whenever the list
/// of instance ids differs from the one seen on the previous call.
pub struct WeightedRoundRobin {
    state: Mutex<SlotTable>,
}

#[derive(Debug, Default)]
struct SlotTable {
    /// Instance ids the table was built from, in list order.
    ids: Vec<String>,
    /// Index into the instance list for every slot.
    slots: Vec<usize>,
    cursor: usize,
}

impl SlotTable {
    fn is_current(&self, instances: &[Arc<ServiceInstance>]) -> bool {
        self.ids.len() == instances.len()
            && self.ids.iter().zip(instances).all(|(id, inst)| id == inst.id())
    }

    fn rebuild(&mut self, instances: &[Arc<ServiceInstance>]) {
        self.ids = instances.iter().map(|i| i.id().to_string()).collect();
        self.slots = instances
            .iter()
            .enumerate()
            .flat_map(|(idx, inst)| std::iter::repeat_n(idx, inst.weight() as usize))
            .collect();
        self.cursor = 0;
    }
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotTable::default()),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for WeightedRoundRobin {
    fn select(
        &self,
        instances: &[Arc<ServiceInstance>],
        _context: Option<&RequestContext>,
    ) -> Option<Arc<ServiceInstance>> {
        if instances.is_empty() {
            return None;
        }

        let mut table = self.state.lock();
        if !table.is_current(instances) {
            table.rebuild(instances);
        }

        // Every instance has weight 0.
        if table.slots.is_empty() {
            return None;
        }

        let idx = table.slots[table.cursor % table.slots.len()];
        table.cursor = (table.cursor + 1) % table.slots.len();
        Some(Arc::clone(&instances[idx]))
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}
