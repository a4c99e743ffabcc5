//! Range-based partition routing
//!
//! Machines are assigned to partitions in contiguous ranges of
//! `machines_per_partition` ids. Partition `i` listens on `base_port + i`.
//! Growth only appends partitions, so an existing machine never changes
//! partition.

mod router;

pub use router::RoutingTable;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::schema::MachineId;

/// Partition index, also the offset from the base port
pub type PartitionId = usize;

/// Routing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Host partitions bind and are addressed on
    pub bind_host: IpAddr,
    /// Port of the control address
    pub control_port: u16,
    /// Port of partition 0
    pub base_port: u16,
    /// Machines owned by each partition
    pub machines_per_partition: u64,
    /// Ports that must never host a partition
    pub reserved_ports: BTreeSet<u16>,
    /// Upper bound on the number of partitions
    pub max_partitions: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: 7000,
            base_port: 7100,
            machines_per_partition: 200,
            reserved_ports: BTreeSet::from([7000]),
            max_partitions: 64,
        }
    }
}

/// Half-open range of machine ids `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineRange {
    pub start: u64,
    pub end: u64,
}

impl MachineRange {
    pub fn contains(&self, machine: MachineId) -> bool {
        machine.0 >= self.start && machine.0 < self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = MachineId> {
        (self.start..self.end).map(MachineId)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// One partition's machine range and listening address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub index: PartitionId,
    pub machines: MachineRange,
    pub addr: SocketAddr,
}

impl PartitionAssignment {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
