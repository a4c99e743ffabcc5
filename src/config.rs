//! Server configuration
//!
//! One plain struct grouping every tunable. The binary fills it from CLI
//! flags and `PROMSKETCH_*` environment variables; tests build it directly.
//! [`ServerConfig::validate`] is the only place configuration is rejected,
//! and it runs before anything binds.

use crate::ingester::IngestConfig;
use crate::query::QueryConfig;
use crate::sharding::RoutingConfig;
use crate::sketch::{AggregateFunction, SketchConfig};
use crate::{Error, Result};

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub routing: RoutingConfig,
    pub sketch: SketchConfig,
    /// Functions of interest; one sketch per function per series
    pub functions: Vec<AggregateFunction>,
    pub ingest: IngestConfig,
    pub query: QueryConfig,
    /// Directory for CSV journals; journals are off when unset
    pub journal_dir: Option<PathBuf>,
    pub throughput_interval: Duration,
    /// Metric to create sketches for eagerly on new partitions
    pub prewarm_metric: Option<String>,
    /// Capacity to register at startup
    pub initial_timeseries: Option<u64>,
    /// Bind a listener per partition
    pub partition_listeners: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            sketch: SketchConfig::default(),
            functions: AggregateFunction::ALL.to_vec(),
            ingest: IngestConfig::default(),
            query: QueryConfig::default(),
            journal_dir: None,
            throughput_interval: Duration::from_secs(5),
            prewarm_metric: None,
            initial_timeseries: None,
            partition_listeners: true,
        }
    }
}

impl ServerConfig {
    /// Reject configurations that could route data to a reserved address or
    /// could never serve a request.
    pub fn validate(&self) -> Result<()> {
        let routing = &self.routing;
        if routing.machines_per_partition == 0 {
            return Err(Error::Config(
                "machines_per_partition must be positive".to_string(),
            ));
        }
        if routing.max_partitions == 0 {
            return Err(Error::Config("max_partitions must be positive".to_string()));
        }
        if !routing.reserved_ports.contains(&routing.control_port) {
            return Err(Error::Config(format!(
                "control port {} must be in the reserved set",
                routing.control_port
            )));
        }

        let first = routing.base_port as u64;
        let last = first + routing.max_partitions as u64 - 1;
        if last > u16::MAX as u64 {
            return Err(Error::Config(format!(
                "{} partitions from base port {} exceed the port space",
                routing.max_partitions, routing.base_port
            )));
        }
        if let Some(port) = routing
            .reserved_ports
            .iter()
            .find(|p| (first..=last).contains(&(**p as u64)))
        {
            return Err(Error::Config(format!(
                "reserved port {} lies in the partition range {}..={}",
                port, first, last
            )));
        }

        if self.ingest.max_concurrent_inserts == 0 {
            return Err(Error::Config(
                "max_concurrent_inserts must be positive".to_string(),
            ));
        }
        if self.functions.is_empty() {
            return Err(Error::Config(
                "at least one function of interest is required".to_string(),
            ));
        }
        if self.sketch.time_window_ms <= 0 || self.sketch.item_window == 0 {
            return Err(Error::Config(
                "sketch time_window_ms and item_window must be positive".to_string(),
            ));
        }
        if self.sketch.bucket_ms <= 0 || self.sketch.bucket_ms > self.sketch.time_window_ms {
            return Err(Error::Config(format!(
                "sketch bucket_ms must be in 1..={}, got {}",
                self.sketch.time_window_ms, self.sketch.bucket_ms
            )));
        }
        if self.throughput_interval.is_zero() {
            return Err(Error::Config(
                "throughput_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
