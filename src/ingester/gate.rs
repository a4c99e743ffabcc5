//! Process-wide admission for partition inserts

use super::{telemetry, IngestConfig, IngestOutcome, PartitionNode};
use crate::metrics::{reason, ServerMetrics};
use crate::schema::IngestBatch;
use crate::{Error, Result};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Bounds concurrent partition inserts across the whole process.
///
/// Each sub-batch holds one permit while it is applied. Callers beyond the
/// ceiling wait for a permit. The send timeout only bounds that wait: a
/// sub-batch still queued when it expires is dropped unapplied, while one
/// that holds a permit always runs to completion and is reported.
pub struct IngestGate {
    permits: Arc<Semaphore>,
    capacity: usize,
    send_timeout: Duration,
    metrics: Arc<ServerMetrics>,
}

impl IngestGate {
    pub fn new(config: &IngestConfig, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_inserts)),
            capacity: config.max_concurrent_inserts,
            send_timeout: config.send_timeout,
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop admitting new work. Queued and future submissions fail.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Apply a routed sub-batch, giving up if no permit frees up within the
    /// send timeout.
    pub async fn submit(&self, node: Arc<PartitionNode>, batch: IngestBatch) -> Result<IngestOutcome> {
        let queued_at = Instant::now();
        let acquire = self.permits.clone().acquire_owned();
        let permit = match tokio::time::timeout(self.send_timeout, acquire).await {
            Ok(permit) => permit?,
            Err(_) => return Ok(self.abandon(node.index(), batch.len())),
        };
        self.run(permit, node, batch, queued_at).await
    }

    /// Apply a batch addressed to one partition. Waits for a permit as long
    /// as it takes.
    pub async fn apply(&self, node: Arc<PartitionNode>, batch: IngestBatch) -> Result<IngestOutcome> {
        let queued_at = Instant::now();
        let permit = self.permits.clone().acquire_owned().await?;
        self.run(permit, node, batch, queued_at).await
    }

    async fn run(
        &self,
        permit: OwnedSemaphorePermit,
        node: Arc<PartitionNode>,
        batch: IngestBatch,
        queued_at: Instant,
    ) -> Result<IngestOutcome> {
        telemetry::record_gate_wait(queued_at.elapsed().as_secs_f64());
        let partition = node.index();
        // detached: a caller that goes away cannot cut a sub-batch short
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let outcome = node.ingest(&batch).await;
            telemetry::record_sub_batch(started.elapsed().as_secs_f64(), batch.len() as u64);
            outcome
        });
        handle.await.map_err(|join_err| {
            Error::Internal(format!(
                "ingest task for partition {} failed: {}",
                partition, join_err
            ))
        })
    }

    fn abandon(&self, partition: usize, samples: usize) -> IngestOutcome {
        warn!(
            partition,
            samples,
            timeout_ms = self.send_timeout.as_millis() as u64,
            "Dropping queued sub-batch after send timeout"
        );
        self.metrics.record_failure(reason::TIMEOUT, samples as u64);
        telemetry::record_abandoned(samples as u64);
        IngestOutcome {
            timed_out: samples,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::BoundedClock;
    use crate::ingester::NodeContext;
    use crate::sharding::{MachineRange, PartitionAssignment};
    use crate::sketch::{AggregateFunction, SketchConfig, WindowedSketchFactory};
    use std::net::SocketAddr;

    fn node(metrics: Arc<ServerMetrics>) -> Arc<PartitionNode> {
        Arc::new(PartitionNode::new(
            PartitionAssignment {
                index: 0,
                machines: MachineRange { start: 0, end: 200 },
                addr: SocketAddr::from(([127, 0, 0, 1], 7100)),
            },
            NodeContext {
                functions: vec![AggregateFunction::AvgOverTime].into(),
                sketch: SketchConfig::default(),
                factory: Arc::new(WindowedSketchFactory),
                clock: Arc::new(BoundedClock::new()),
                metrics,
            },
        ))
    }

    fn batch() -> IngestBatch {
        let mut batch = IngestBatch::new(1000);
        batch.push("cpu", [("machineid", "machine_0")], 1.0);
        batch.push("cpu", [("machineid", "machine_1")], 2.0);
        batch
    }

    #[tokio::test]
    async fn test_submit_applies_batch_and_releases_permit() {
        let metrics = Arc::new(ServerMetrics::new().unwrap());
        let gate = IngestGate::new(&IngestConfig::default(), metrics.clone());
        let outcome = gate.submit(node(metrics), batch()).await.unwrap();
        assert_eq!(outcome.ingested, 2);
        assert_eq!(gate.available_permits(), gate.capacity());
    }

    #[tokio::test]
    async fn test_queued_submission_times_out() {
        let metrics = Arc::new(ServerMetrics::new().unwrap());
        let config = IngestConfig {
            max_concurrent_inserts: 1,
            send_timeout: Duration::from_millis(20),
        };
        let gate = IngestGate::new(&config, metrics.clone());
        // hold the only permit
        let held = gate.permits.clone().acquire_owned().await.unwrap();

        let node = node(metrics.clone());
        let outcome = gate.submit(node.clone(), batch()).await.unwrap();
        assert_eq!(outcome.timed_out, 2);
        assert_eq!(outcome.ingested, 0);

        drop(held);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // abandoned while queued: never applied
        assert_eq!(node.sketch_count(), 0);
    }

    #[tokio::test]
    async fn test_apply_waits_past_send_timeout() {
        let metrics = Arc::new(ServerMetrics::new().unwrap());
        let config = IngestConfig {
            max_concurrent_inserts: 1,
            send_timeout: Duration::from_millis(10),
        };
        let gate = Arc::new(IngestGate::new(&config, metrics.clone()));
        let held = gate.permits.clone().acquire_owned().await.unwrap();

        let node = node(metrics.clone());
        let pending = tokio::spawn({
            let gate = gate.clone();
            let node = node.clone();
            async move { gate.apply(node, batch()).await }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        drop(held);

        let outcome = pending.await.unwrap().unwrap();
        assert_eq!(outcome.ingested, 2);
        assert_eq!(outcome.timed_out, 0);
        assert_eq!(node.sketch_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_gate_errors() {
        let metrics = Arc::new(ServerMetrics::new().unwrap());
        let gate = IngestGate::new(&IngestConfig::default(), metrics.clone());
        gate.close();
        assert!(gate.submit(node(metrics.clone()), batch()).await.is_err());
        assert!(gate.apply(node(metrics), batch()).await.is_err());
    }
}
