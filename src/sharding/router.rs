//! Routing table: machine id to partition address

use super::{MachineRange, PartitionAssignment, PartitionId, RoutingConfig};
use crate::schema::MachineId;
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};

/// An immutable partition plan.
///
/// Structural changes go through [`RoutingTable::extended`], which returns a
/// new table; callers publish it atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    bind_host: IpAddr,
    base_port: u16,
    machines_per_partition: u64,
    reserved_ports: BTreeSet<u16>,
    assignments: Vec<PartitionAssignment>,
}

impl RoutingTable {
    /// Empty plan. Rejects a zero partition size.
    pub fn new(config: &RoutingConfig) -> Result<Self> {
        if config.machines_per_partition == 0 {
            return Err(Error::Config(
                "machines_per_partition must be positive".to_string(),
            ));
        }
        let mut reserved_ports = config.reserved_ports.clone();
        reserved_ports.insert(config.control_port);
        Ok(Self {
            bind_host: config.bind_host,
            base_port: config.base_port,
            machines_per_partition: config.machines_per_partition,
            reserved_ports,
            assignments: Vec::new(),
        })
    }

    pub fn machines_per_partition(&self) -> u64 {
        self.machines_per_partition
    }

    /// Same plan parameters with a different partition size. Only meaningful
    /// while no partition exists yet.
    pub fn with_machines_per_partition(&self, machines_per_partition: u64) -> Result<Self> {
        if !self.assignments.is_empty() {
            return Err(Error::PartitionSizeMismatch {
                active: self.machines_per_partition,
                requested: machines_per_partition,
            });
        }
        if machines_per_partition == 0 {
            return Err(Error::Validation(
                "machines_per_port must be positive".to_string(),
            ));
        }
        Ok(Self {
            machines_per_partition,
            ..self.clone()
        })
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn assignments(&self) -> &[PartitionAssignment] {
        &self.assignments
    }

    pub fn get(&self, index: PartitionId) -> Option<&PartitionAssignment> {
        self.assignments.get(index)
    }

    /// Partition owning `machine`, if one has been provisioned.
    pub fn route(&self, machine: MachineId) -> Option<&PartitionAssignment> {
        let index = machine.0 / self.machines_per_partition;
        usize::try_from(index)
            .ok()
            .and_then(|i| self.assignments.get(i))
    }

    /// Partitions needed for `capacity_hint` series.
    pub fn required_partitions(&self, capacity_hint: u64) -> usize {
        capacity_hint.div_ceil(self.machines_per_partition) as usize
    }

    /// Assignments that would be appended to reach `required` partitions.
    ///
    /// Nothing is mutated. Any assignment landing on a reserved port fails the
    /// whole plan.
    pub fn plan_extension(&self, required: usize) -> Result<Vec<PartitionAssignment>> {
        let mut planned = Vec::new();
        for index in self.assignments.len()..required {
            let port = u16::try_from(index)
                .ok()
                .and_then(|offset| self.base_port.checked_add(offset))
                .ok_or_else(|| {
                    Error::Config(format!(
                        "partition {} exceeds the port space from base port {}",
                        index, self.base_port
                    ))
                })?;
            if self.reserved_ports.contains(&port) {
                return Err(Error::ReservedAddress { port });
            }
            let start = index as u64 * self.machines_per_partition;
            planned.push(PartitionAssignment {
                index,
                machines: MachineRange {
                    start,
                    end: start + self.machines_per_partition,
                },
                addr: SocketAddr::new(self.bind_host, port),
            });
        }
        Ok(planned)
    }

    /// New table with `added` appended. `added` must continue the index
    /// sequence, as produced by [`Self::plan_extension`].
    pub fn extended(&self, added: &[PartitionAssignment]) -> Result<Self> {
        let mut next = self.clone();
        for assignment in added {
            if assignment.index != next.assignments.len() {
                return Err(Error::Internal(format!(
                    "non-contiguous partition index {} (expected {})",
                    assignment.index,
                    next.assignments.len()
                )));
            }
            next.assignments.push(assignment.clone());
        }
        Ok(next)
    }

    /// Ports currently serving partitions
    pub fn ports(&self) -> Vec<u16> {
        self.assignments.iter().map(|a| a.port()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        RoutingTable::new(&RoutingConfig::default()).unwrap()
    }

    fn grown(required: usize) -> RoutingTable {
        let t = table();
        let plan = t.plan_extension(required).unwrap();
        t.extended(&plan).unwrap()
    }

    #[test]
    fn test_required_partitions_ceil() {
        let t = table();
        assert_eq!(t.required_partitions(1), 1);
        assert_eq!(t.required_partitions(200), 1);
        assert_eq!(t.required_partitions(201), 2);
        assert_eq!(t.required_partitions(1000), 5);
    }

    #[test]
    fn test_route_ranges() {
        let t = grown(3);
        assert_eq!(t.route(MachineId(0)).unwrap().port(), 7100);
        assert_eq!(t.route(MachineId(199)).unwrap().port(), 7100);
        assert_eq!(t.route(MachineId(200)).unwrap().port(), 7101);
        assert_eq!(t.route(MachineId(599)).unwrap().port(), 7102);
        assert!(t.route(MachineId(600)).is_none());
    }

    #[test]
    fn test_route_deterministic() {
        let t = grown(4);
        for m in [0u64, 17, 250, 799] {
            let first = t.route(MachineId(m)).cloned();
            for _ in 0..10 {
                assert_eq!(t.route(MachineId(m)).cloned(), first);
            }
        }
    }

    #[test]
    fn test_growth_is_monotonic() {
        let small = grown(2);
        let plan = small.plan_extension(5).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].index, 2);
        let large = small.extended(&plan).unwrap();
        for m in 0..400 {
            assert_eq!(small.route(MachineId(m)), large.route(MachineId(m)));
        }
    }

    #[test]
    fn test_plan_for_smaller_hint_is_empty() {
        let t = grown(3);
        assert!(t.plan_extension(2).unwrap().is_empty());
        assert!(t.plan_extension(3).unwrap().is_empty());
    }

    #[test]
    fn test_reserved_port_rejected() {
        let config = RoutingConfig {
            base_port: 6998,
            ..RoutingConfig::default()
        };
        let t = RoutingTable::new(&config).unwrap();
        assert!(t.plan_extension(2).is_ok());
        match t.plan_extension(3) {
            Err(Error::ReservedAddress { port }) => assert_eq!(port, 7000),
            other => panic!("expected reserved address error, got {:?}", other),
        }
    }

    #[test]
    fn test_port_overflow_rejected() {
        let config = RoutingConfig {
            base_port: u16::MAX,
            ..RoutingConfig::default()
        };
        let t = RoutingTable::new(&config).unwrap();
        assert!(t.plan_extension(1).is_ok());
        assert!(matches!(t.plan_extension(2), Err(Error::Config(_))));
    }

    #[test]
    fn test_partition_size_locked_after_first_partition() {
        let t = table().with_machines_per_partition(50).unwrap();
        assert_eq!(t.required_partitions(120), 3);
        let t = t.extended(&t.plan_extension(1).unwrap()).unwrap();
        assert!(matches!(
            t.with_machines_per_partition(100),
            Err(Error::PartitionSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_partition_size_rejected() {
        let config = RoutingConfig {
            machines_per_partition: 0,
            ..RoutingConfig::default()
        };
        assert!(RoutingTable::new(&config).is_err());
    }
}
