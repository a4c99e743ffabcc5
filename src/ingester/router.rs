//! Split a batch by owning partition and dispatch through the gate

use super::{telemetry, IngestGate, IngestOutcome};
use crate::cluster::PartitionTable;
use crate::metrics::{reason, ServerMetrics};
use crate::schema::{IngestBatch, RawMetric};
use crate::sharding::PartitionId;
use crate::Result;

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct IngestRouter {
    table: Arc<PartitionTable>,
    gate: Arc<IngestGate>,
    metrics: Arc<ServerMetrics>,
}

impl IngestRouter {
    pub fn new(table: Arc<PartitionTable>, gate: Arc<IngestGate>, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            table,
            gate,
            metrics,
        }
    }

    pub fn gate(&self) -> &Arc<IngestGate> {
        &self.gate
    }

    /// Route every sample to its partition and apply the sub-batches
    /// concurrently, bounded by the gate.
    ///
    /// Routing uses one snapshot of the partition table for the whole batch.
    pub async fn ingest(&self, batch: IngestBatch) -> Result<IngestOutcome> {
        let snapshot = self.table.snapshot();
        let mut groups: BTreeMap<PartitionId, Vec<RawMetric>> = BTreeMap::new();
        let mut unrouted = 0usize;
        let mut malformed = 0usize;

        for raw in batch.metrics {
            let machine = match raw.identity().machine_id() {
                Ok(machine) => machine,
                Err(e) => {
                    debug!(error = %e, "Sample rejected before routing");
                    malformed += 1;
                    continue;
                }
            };
            match snapshot.routing.route(machine) {
                Some(assignment) => groups.entry(assignment.index).or_default().push(raw),
                None => unrouted += 1,
            }
        }

        if malformed > 0 {
            self.metrics.record_failure(reason::INVALID_SAMPLE, malformed as u64);
        }

        if unrouted > 0 {
            warn!(
                unrouted,
                partitions = snapshot.routing.len(),
                "Samples for machines without a provisioned partition"
            );
            self.metrics.record_failure(reason::UNROUTED, unrouted as u64);
            telemetry::record_unrouted(unrouted as u64);
        }

        let submissions = groups.into_iter().filter_map(|(index, metrics)| {
            let node = snapshot.nodes.get(index)?.clone();
            let sub_batch = IngestBatch {
                timestamp: batch.timestamp,
                metrics,
            };
            Some(self.gate.submit(node, sub_batch))
        });

        let mut outcome = IngestOutcome {
            failed: malformed,
            unrouted,
            ..Default::default()
        };
        for result in join_all(submissions).await {
            outcome.merge(result?);
        }

        debug!(
            ingested = outcome.ingested,
            failed = outcome.failed,
            unrouted = outcome.unrouted,
            timed_out = outcome.timed_out,
            "Routed batch"
        );
        Ok(outcome)
    }
}
