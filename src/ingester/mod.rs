//! Ingestion path
//!
//! - [`PartitionNode`] owns the sketch instances for one machine range and
//!   applies batches to them with per-sample failure isolation.
//! - [`IngestGate`] bounds the number of in-flight partition inserts
//!   process-wide and drops routed sub-batches still queued after the send timeout.
//! - [`IngestRouter`] splits a batch by owning partition and dispatches the
//!   pieces through the gate.

mod gate;
mod node;
mod router;
pub(crate) mod telemetry;

pub use gate::IngestGate;
pub use node::{MachineCoverage, NodeContext, NodeStatus, PartitionNode, PartitionReport, SketchKey};
pub use router::IngestRouter;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the ingest path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Process-wide ceiling on concurrent partition inserts
    pub max_concurrent_inserts: usize,
    /// Time a routed sub-batch may wait for a permit before it is dropped
    pub send_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent_inserts: 64,
            send_timeout: Duration::from_secs(8),
        }
    }
}

/// Per-batch result counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOutcome {
    /// Samples inserted into every sketch of interest
    pub ingested: usize,
    /// Samples rejected or only partly inserted
    pub failed: usize,
    /// Samples whose machine has no provisioned partition
    pub unrouted: usize,
    /// Samples in routed sub-batches that found no permit within the send timeout
    pub timed_out: usize,
}

impl IngestOutcome {
    pub fn merge(&mut self, other: IngestOutcome) {
        self.ingested += other.ingested;
        self.failed += other.failed;
        self.unrouted += other.unrouted;
        self.timed_out += other.timed_out;
    }

    pub fn total(&self) -> usize {
        self.ingested + self.failed + self.unrouted + self.timed_out
    }
}
