//! Capacity registration and the aggregate debug view

use super::{DebugState, PartitionPlan, PartitionSpawner, PartitionTable, RegisterRequest, TableSnapshot};
use crate::ingester::{NodeContext, PartitionNode};
use crate::metrics::ServerMetrics;
use crate::{Error, Result};

use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ControlPlane {
    table: Arc<PartitionTable>,
    context: NodeContext,
    spawner: Arc<dyn PartitionSpawner>,
    max_partitions: usize,
    prewarm_metric: Option<String>,
    metrics: Arc<ServerMetrics>,
}

impl ControlPlane {
    pub fn new(
        table: Arc<PartitionTable>,
        context: NodeContext,
        spawner: Arc<dyn PartitionSpawner>,
        max_partitions: usize,
        prewarm_metric: Option<String>,
    ) -> Self {
        let metrics = context.metrics.clone();
        Self {
            table,
            context,
            spawner,
            max_partitions,
            prewarm_metric,
            metrics,
        }
    }

    pub fn table(&self) -> &Arc<PartitionTable> {
        &self.table
    }

    /// Extend the partition plan to cover `estimated_timeseries`.
    ///
    /// Idempotent and extend-only. The count check and the provisioning
    /// happen under one lock, so racing calls for the same capacity provision
    /// each partition once. Every new partition is serving before this
    /// returns `Ok`.
    pub async fn register_config(&self, request: RegisterRequest) -> Result<PartitionPlan> {
        if request.estimated_timeseries == 0 {
            self.metrics.record_registration("rejected");
            return Err(Error::Validation(
                "estimated_timeseries must be positive".to_string(),
            ));
        }

        let guard = self.table.lock_provisioning().await;
        let current = self.table.snapshot();

        let routing = match request.machines_per_port {
            Some(requested) if requested != current.routing.machines_per_partition() => {
                match current.routing.with_machines_per_partition(requested) {
                    Ok(routing) => routing,
                    Err(e) => {
                        self.metrics.record_registration("rejected");
                        return Err(e);
                    }
                }
            }
            _ => current.routing.clone(),
        };

        let required = routing.required_partitions(request.estimated_timeseries);
        if required > self.max_partitions {
            self.metrics.record_registration("rejected");
            return Err(Error::CapacityExceeded {
                required,
                max: self.max_partitions,
            });
        }

        let planned = match routing.plan_extension(required) {
            Ok(planned) => planned,
            Err(e) => {
                self.metrics.record_registration("rejected");
                return Err(e);
            }
        };

        if planned.is_empty() {
            debug!(
                estimated_timeseries = request.estimated_timeseries,
                active = current.len(),
                "Registration already satisfied"
            );
            self.metrics.record_registration("noop");
            return Ok(PartitionPlan::from_snapshot(&current, 0));
        }

        let mut nodes = current.nodes.clone();
        let mut added = Vec::with_capacity(planned.len());
        let mut failure = None;

        for assignment in planned {
            let node = Arc::new(PartitionNode::new(assignment.clone(), self.context.clone()));
            if let Err(e) = self.spawner.spawn(node.clone()).await {
                warn!(partition = assignment.index, error = %e, "Partition failed to start");
                failure = Some(e);
                break;
            }
            if let Some(metric) = &self.prewarm_metric {
                if let Err(e) = node.prewarm(metric) {
                    warn!(partition = assignment.index, metric = %metric, error = %e, "Prewarm failed");
                }
            }
            nodes.push(node);
            added.push(assignment);
        }

        // Whatever started is published, even if a later partition failed.
        let snapshot = TableSnapshot {
            routing: routing.extended(&added)?,
            nodes,
        };
        self.metrics.partitions_active.set(snapshot.len() as i64);
        let plan = PartitionPlan::from_snapshot(&snapshot, added.len());
        self.table.publish(&guard, snapshot);
        drop(guard);

        if let Some(e) = failure {
            self.metrics.record_registration("failed");
            return Err(Error::Provisioning(format!(
                "started {} of {} required partitions: {}",
                plan.ports_active.len(),
                required,
                e
            )));
        }

        info!(
            estimated_timeseries = request.estimated_timeseries,
            partitions_added = plan.partitions_added,
            partitions_active = plan.ports_active.len(),
            machines_per_partition = plan.machines_per_partition,
            "Extended partition plan"
        );
        self.metrics.record_registration("extended");
        Ok(plan)
    }

    /// Per-partition coverage and consistency report. A partition that is not
    /// serving is reported as degraded; the call itself never fails.
    pub fn debug_state(&self) -> DebugState {
        let snapshot = self.table.snapshot();
        let partitions: Vec<_> = snapshot.nodes.iter().map(|node| node.report()).collect();
        let degraded_partitions = partitions.iter().filter(|p| p.degraded).count();
        let total_sketches = partitions.iter().map(|p| p.sketch_count).sum();
        self.metrics.sketch_instances.set(total_sketches as i64);

        DebugState {
            status: if degraded_partitions == 0 {
                "ok".to_string()
            } else {
                "degraded".to_string()
            },
            machines_per_partition: snapshot.routing.machines_per_partition(),
            ports_active: snapshot.routing.ports(),
            total_sketches,
            degraded_partitions,
            partitions,
        }
    }
}
