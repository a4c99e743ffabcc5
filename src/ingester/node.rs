//! Partition node: sketch instances for one machine range

use super::IngestOutcome;
use crate::clock::BoundedClock;
use crate::metrics::{reason, ServerMetrics};
use crate::schema::{IngestBatch, LabelSet, MachineId, RawMetric, SeriesIdentity, MACHINE_LABEL};
use crate::sharding::{MachineRange, PartitionAssignment, PartitionId};
use crate::sketch::{AggregateFunction, SketchConfig, SketchFactory, SketchInstance};
use crate::{Error, Result};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared settings every node is built with
#[derive(Clone)]
pub struct NodeContext {
    /// Functions of interest; every sample is inserted into one sketch per function
    pub functions: Arc<[AggregateFunction]>,
    pub sketch: SketchConfig,
    pub factory: Arc<dyn SketchFactory>,
    pub clock: Arc<BoundedClock>,
    pub metrics: Arc<ServerMetrics>,
}

/// Key of one sketch instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SketchKey {
    pub identity: SeriesIdentity,
    pub function: AggregateFunction,
}

/// Lifecycle of a node's endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum NodeStatus {
    Starting,
    Serving,
    Stopped,
    Failed(String),
}

/// Coverage roll-up for one machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MachineCoverage {
    pub sketches: usize,
    pub covered_sketches: usize,
    pub min_observed: Option<i64>,
    pub max_observed: Option<i64>,
}

/// One partition's section of the debug report
#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    pub index: PartitionId,
    pub port: u16,
    pub machines: MachineRange,
    pub status: NodeStatus,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub sketch_count: usize,
    pub ingested_samples: u64,
    pub failed_samples: u64,
    pub last_insert_ms: Option<i64>,
    pub inconsistent_instances: usize,
    pub machine_coverage: BTreeMap<String, MachineCoverage>,
}

/// Owns every sketch instance for the series of one machine range.
pub struct PartitionNode {
    assignment: PartitionAssignment,
    context: NodeContext,
    instances: DashMap<SketchKey, Arc<SketchInstance>>,
    status: RwLock<NodeStatus>,
    ingested: AtomicU64,
    failed: AtomicU64,
}

impl PartitionNode {
    pub fn new(assignment: PartitionAssignment, context: NodeContext) -> Self {
        Self {
            assignment,
            context,
            instances: DashMap::new(),
            status: RwLock::new(NodeStatus::Starting),
            ingested: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn assignment(&self) -> &PartitionAssignment {
        &self.assignment
    }

    pub fn index(&self) -> PartitionId {
        self.assignment.index
    }

    pub fn functions(&self) -> &[AggregateFunction] {
        &self.context.functions
    }

    pub fn status(&self) -> NodeStatus {
        self.status.read().clone()
    }

    pub fn set_status(&self, status: NodeStatus) {
        *self.status.write() = status;
    }

    pub fn sketch_count(&self) -> usize {
        self.instances.len()
    }

    pub fn owns(&self, machine: MachineId) -> bool {
        self.assignment.machines.contains(machine)
    }

    /// Apply a batch. Bad samples are logged and skipped; the outcome counts
    /// only samples inserted into every sketch of interest.
    pub async fn ingest(&self, batch: &IngestBatch) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        for raw in &batch.metrics {
            match self.ingest_one(raw, batch.timestamp).await {
                Ok(()) => outcome.ingested += 1,
                Err(e) => {
                    warn!(
                        partition = self.assignment.index,
                        series = %raw.identity(),
                        timestamp = batch.timestamp,
                        error = %e,
                        "Skipping sample"
                    );
                    let label = match e {
                        Error::InvalidSample(_) => reason::INVALID_SAMPLE,
                        Error::Validation(_) => reason::OUT_OF_RANGE,
                        _ => reason::SKETCH,
                    };
                    self.context.metrics.record_failure(label, 1);
                    outcome.failed += 1;
                }
            }
        }

        self.ingested
            .fetch_add(outcome.ingested as u64, Ordering::Relaxed);
        self.failed.fetch_add(outcome.failed as u64, Ordering::Relaxed);
        self.context
            .metrics
            .total_ingested
            .inc_by(outcome.ingested as u64);

        debug!(
            partition = self.assignment.index,
            ingested = outcome.ingested,
            failed = outcome.failed,
            "Applied batch"
        );
        outcome
    }

    async fn ingest_one(&self, raw: &RawMetric, timestamp: i64) -> Result<()> {
        let sample = raw.to_sample(timestamp)?;
        let machine = sample.identity.machine_id()?;
        if !self.owns(machine) {
            return Err(Error::Validation(format!(
                "{} is outside partition {} ({}..{})",
                machine,
                self.assignment.index,
                self.assignment.machines.start,
                self.assignment.machines.end
            )));
        }

        let wall_ms = self.context.clock.now_millis();
        for function in self.context.functions.iter().copied() {
            let instance = self.get_or_create(&sample.identity, function)?;
            instance
                .insert(sample.timestamp, sample.value, wall_ms)
                .await?;
        }
        Ok(())
    }

    /// Instance for `(identity, function)`, created through the factory on
    /// first use. The map guard is released before returning.
    pub fn get_or_create(
        &self,
        identity: &SeriesIdentity,
        function: AggregateFunction,
    ) -> Result<Arc<SketchInstance>> {
        let key = SketchKey {
            identity: identity.clone(),
            function,
        };
        if let Some(existing) = self.instances.get(&key) {
            return Ok(existing.value().clone());
        }

        let mut created = false;
        let instance = self
            .instances
            .entry(key)
            .or_try_insert_with(|| {
                let engine = self
                    .context
                    .factory
                    .create(identity, function, &self.context.sketch)?;
                created = true;
                Ok::<_, Error>(Arc::new(SketchInstance::new(
                    identity.clone(),
                    function,
                    self.context.sketch,
                    engine,
                )))
            })?
            .value()
            .clone();

        if created {
            self.context.metrics.sketch_instances.inc();
            debug!(
                partition = self.assignment.index,
                series = %identity,
                function = %function,
                "Created sketch instance"
            );
        }
        Ok(instance)
    }

    /// Existing instance only; never creates.
    pub fn instance(
        &self,
        identity: &SeriesIdentity,
        function: AggregateFunction,
    ) -> Option<Arc<SketchInstance>> {
        let key = SketchKey {
            identity: identity.clone(),
            function,
        };
        self.instances.get(&key).map(|entry| entry.value().clone())
    }

    /// Eagerly create instances for `metric` on every machine in range.
    pub fn prewarm(&self, metric: &str) -> Result<usize> {
        let mut count = 0;
        for machine in self.assignment.machines.iter() {
            let labels = LabelSet::from_pairs([(MACHINE_LABEL, machine.label_value())]);
            let identity = SeriesIdentity::new(metric, labels);
            for function in self.context.functions.iter().copied() {
                self.get_or_create(&identity, function)?;
                count += 1;
            }
        }
        debug!(
            partition = self.assignment.index,
            metric,
            instances = count,
            "Prewarmed sketch instances"
        );
        Ok(count)
    }

    /// Build this node's debug section from instance summaries.
    pub fn report(&self) -> PartitionReport {
        let status = self.status();
        let (degraded, reason) = match &status {
            NodeStatus::Serving => (false, None),
            NodeStatus::Starting => (true, Some("partition endpoint is starting".to_string())),
            NodeStatus::Stopped => (true, Some("partition endpoint stopped".to_string())),
            NodeStatus::Failed(msg) => (true, Some(msg.clone())),
        };

        let mut machine_coverage: BTreeMap<String, MachineCoverage> = BTreeMap::new();
        let mut last_insert_ms: Option<i64> = None;
        let mut inconsistent = 0;

        for entry in self.instances.iter() {
            let instance = entry.value();
            let summary = instance.summary();
            if !summary.is_consistent() {
                inconsistent += 1;
            }
            last_insert_ms = last_insert_ms.max(summary.last_insert_ms);

            // instances only exist for identities that passed validation
            let Ok(machine) = instance.identity().machine_id() else {
                continue;
            };
            let coverage = machine_coverage.entry(machine.to_string()).or_default();
            coverage.sketches += 1;
            if summary.inserts > 0 {
                coverage.covered_sketches += 1;
            }
            coverage.min_observed = match (coverage.min_observed, summary.min_observed) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            coverage.max_observed = coverage.max_observed.max(summary.max_observed);
        }

        PartitionReport {
            index: self.assignment.index,
            port: self.assignment.port(),
            machines: self.assignment.machines,
            status,
            degraded,
            reason,
            sketch_count: self.instances.len(),
            ingested_samples: self.ingested.load(Ordering::Relaxed),
            failed_samples: self.failed.load(Ordering::Relaxed),
            last_insert_ms,
            inconsistent_instances: inconsistent,
            machine_coverage,
        }
    }
}

impl std::fmt::Debug for PartitionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionNode")
            .field("assignment", &self.assignment)
            .field("sketches", &self.instances.len())
            .field("status", &self.status())
            .finish()
    }
}
