//! The authoritative partition table
//!
//! Readers take an `Arc` snapshot and never block writers for longer than a
//! pointer swap. Writers serialize on the provisioning mutex, which is held
//! across the whole check-count-then-act sequence of a registration.

use crate::ingester::PartitionNode;
use crate::schema::MachineId;
use crate::sharding::{PartitionId, RoutingTable};

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Proof that the caller holds the provisioning lock
pub struct ProvisioningGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

/// A consistent view of the routing plan and the nodes serving it.
///
/// `nodes[i]` serves `routing.assignments()[i]`.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub routing: RoutingTable,
    pub nodes: Vec<Arc<PartitionNode>>,
}

impl TableSnapshot {
    /// Node owning `machine`, if provisioned.
    pub fn node_for(&self, machine: MachineId) -> Option<&Arc<PartitionNode>> {
        let assignment = self.routing.route(machine)?;
        self.nodes.get(assignment.index)
    }

    pub fn node(&self, index: PartitionId) -> Option<&Arc<PartitionNode>> {
        self.nodes.get(index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct PartitionTable {
    provisioning: Mutex<()>,
    current: RwLock<Arc<TableSnapshot>>,
}

impl PartitionTable {
    pub fn new(routing: RoutingTable) -> Self {
        Self {
            provisioning: Mutex::new(()),
            current: RwLock::new(Arc::new(TableSnapshot {
                routing,
                nodes: Vec::new(),
            })),
        }
    }

    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.current.read().clone()
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for exclusive structural access.
    pub async fn lock_provisioning(&self) -> ProvisioningGuard<'_> {
        ProvisioningGuard(self.provisioning.lock().await)
    }

    /// Replace the published snapshot. Only callable under the provisioning
    /// lock.
    pub fn publish(&self, _guard: &ProvisioningGuard<'_>, snapshot: TableSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}
