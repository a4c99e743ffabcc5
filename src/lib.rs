//! # promsketch
//!
//! Partitioned ingestion and coverage-gated querying of sketch-backed
//! windowed aggregates.
//!
//! Samples from many machines are routed by machine id to partitions. Each
//! partition keeps one approximate sketch per (series, function) pair and
//! tracks the time interval those sketches have observed. Queries over a
//! window are answered only once the observed interval spans it; until then
//! callers get a pending answer and retry.
//!
//! ## Architecture
//!
//! - **Control plane**: turns capacity hints into partitions and reports
//!   per-partition debug state
//! - **Ingester**: routes batches to partitions behind a process-wide
//!   concurrency ceiling
//! - **Query**: resolves a series to its sketch and gates on coverage
//! - **Sketch**: the engine seam and the bundled windowed engine

pub mod api;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod ingester;
pub mod journal;
pub mod metrics;
pub mod query;
pub mod schema;
pub mod sharding;
pub mod sketch;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::api::{ApiState, SpawnMode};
    pub use crate::cluster::{ControlPlane, DebugState, PartitionPlan, RegisterRequest};
    pub use crate::config::ServerConfig;
    pub use crate::ingester::{IngestConfig, IngestOutcome, IngestRouter};
    pub use crate::query::{QueryConfig, QueryEvaluator, QueryOutcome, QueryRequest};
    pub use crate::schema::{IngestBatch, LabelSet, MachineId, SeriesIdentity};
    pub use crate::sketch::{AggregateFunction, SketchConfig, SketchEngine, SketchFactory};
    pub use crate::{Error, Result};
}
