//! Bringing partition endpoints up
//!
//! Partitions share the process. Each one gets its own axum listener task on
//! its assigned address, sharing the partition table by reference.

use crate::api::{self, PartitionState};
use crate::ingester::{IngestGate, NodeStatus, PartitionNode};
use crate::{Error, Result};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Makes a freshly created node addressable.
///
/// Must not return `Ok` before the node accepts traffic.
#[async_trait]
pub trait PartitionSpawner: Send + Sync {
    async fn spawn(&self, node: Arc<PartitionNode>) -> Result<()>;
}

/// Marks nodes serving without opening a listener. Nodes are reached only
/// through the control address.
#[derive(Debug, Clone, Default)]
pub struct InProcessSpawner;

#[async_trait]
impl PartitionSpawner for InProcessSpawner {
    async fn spawn(&self, node: Arc<PartitionNode>) -> Result<()> {
        node.set_status(NodeStatus::Serving);
        Ok(())
    }
}

/// Binds each partition's address and serves the partition router on it.
pub struct ListenerSpawner {
    gate: Arc<IngestGate>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ListenerSpawner {
    pub fn new(gate: Arc<IngestGate>, shutdown: CancellationToken) -> Self {
        Self {
            gate,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every listener task to finish after shutdown was signalled.
    pub async fn join(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Partition listener task panicked");
            }
        }
    }
}

#[async_trait]
impl PartitionSpawner for ListenerSpawner {
    async fn spawn(&self, node: Arc<PartitionNode>) -> Result<()> {
        let addr = node.assignment().addr;
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let msg = format!("failed to bind partition {} on {}: {}", node.index(), addr, e);
                node.set_status(NodeStatus::Failed(msg.clone()));
                return Err(Error::Provisioning(msg));
            }
        };

        let app = api::partition_router(PartitionState {
            node: node.clone(),
            gate: self.gate.clone(),
        });
        node.set_status(NodeStatus::Serving);
        info!(partition = node.index(), %addr, "Partition listening");

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            match served {
                Ok(()) => node.set_status(NodeStatus::Stopped),
                Err(e) => {
                    error!(partition = node.index(), error = %e, "Partition listener failed");
                    node.set_status(NodeStatus::Failed(e.to_string()));
                }
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }
}
