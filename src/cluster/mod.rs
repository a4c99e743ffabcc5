//! Control plane
//!
//! Owns the partition table, provisions partitions from capacity hints and
//! aggregates every partition's debug section into one report.

mod control_plane;
mod partition_table;
mod spawner;

pub use control_plane::ControlPlane;
pub use partition_table::{PartitionTable, ProvisioningGuard, TableSnapshot};
pub use spawner::{InProcessSpawner, ListenerSpawner, PartitionSpawner};

use crate::ingester::PartitionReport;
use serde::{Deserialize, Serialize};

/// Body of `POST /register_config`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub estimated_timeseries: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machines_per_port: Option<u64>,
}

/// Result of a registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub status: String,
    pub ports_active: Vec<u16>,
    pub partitions_added: usize,
    pub machines_per_partition: u64,
}

impl PartitionPlan {
    fn from_snapshot(snapshot: &TableSnapshot, partitions_added: usize) -> Self {
        Self {
            status: "success".to_string(),
            ports_active: snapshot.routing.ports(),
            partitions_added,
            machines_per_partition: snapshot.routing.machines_per_partition(),
        }
    }
}

/// Aggregate debug report across partitions
#[derive(Debug, Clone, Serialize)]
pub struct DebugState {
    pub status: String,
    pub machines_per_partition: u64,
    pub ports_active: Vec<u16>,
    pub total_sketches: usize,
    pub degraded_partitions: usize,
    pub partitions: Vec<PartitionReport>,
}
