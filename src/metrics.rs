//! Prometheus metrics served at `GET /metrics`.
//!
//! ## Metrics
//!
//! **Counters:**
//! - `promsketch_total_ingested` - samples inserted into every sketch of interest
//! - `promsketch_ingest_failures_total` - rejected samples by reason
//! - `promsketch_queries_total` - query outcomes (success/pending/rejected/error)
//! - `promsketch_registrations_total` - registration results
//!
//! **Gauges:**
//! - `promsketch_partitions_active` - provisioned partitions
//! - `promsketch_sketch_instances` - live sketch instances across partitions
//!
//! **Histograms:**
//! - `promsketch_query_duration_seconds` - query latency by function

use crate::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Failure reasons used as the `reason` label
pub mod reason {
    pub const INVALID_SAMPLE: &str = "invalid_sample";
    pub const SKETCH: &str = "sketch";
    pub const OUT_OF_RANGE: &str = "out_of_range";
    pub const TIMEOUT: &str = "timeout";
    pub const UNROUTED: &str = "unrouted";
}

#[derive(Clone)]
pub struct ServerMetrics {
    pub registry: Registry,

    pub total_ingested: IntCounter,
    pub ingest_failures_total: IntCounterVec,
    pub queries_total: IntCounterVec,
    pub registrations_total: IntCounterVec,

    pub partitions_active: IntGauge,
    pub sketch_instances: IntGauge,

    pub query_duration_seconds: HistogramVec,
}

impl ServerMetrics {
    pub fn new() -> std::result::Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let total_ingested = IntCounter::new(
            "promsketch_total_ingested",
            "Samples inserted into every sketch of interest",
        )?;
        registry.register(Box::new(total_ingested.clone()))?;

        let ingest_failures_total = IntCounterVec::new(
            Opts::new(
                "promsketch_ingest_failures_total",
                "Samples that could not be ingested, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(ingest_failures_total.clone()))?;

        let queries_total = IntCounterVec::new(
            Opts::new("promsketch_queries_total", "Query outcomes"),
            &["outcome"],
        )?;
        registry.register(Box::new(queries_total.clone()))?;

        let registrations_total = IntCounterVec::new(
            Opts::new(
                "promsketch_registrations_total",
                "Capacity registrations by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(registrations_total.clone()))?;

        let partitions_active =
            IntGauge::new("promsketch_partitions_active", "Provisioned partitions")?;
        registry.register(Box::new(partitions_active.clone()))?;

        let sketch_instances = IntGauge::new(
            "promsketch_sketch_instances",
            "Live sketch instances across all partitions",
        )?;
        registry.register(Box::new(sketch_instances.clone()))?;

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "promsketch_query_duration_seconds",
                "Query evaluation latency",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
            &["function"],
        )?;
        registry.register(Box::new(query_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            total_ingested,
            ingest_failures_total,
            queries_total,
            registrations_total,
            partitions_active,
            sketch_instances,
            query_duration_seconds,
        })
    }

    pub fn record_failure(&self, reason: &str, count: u64) {
        if count > 0 {
            self.ingest_failures_total
                .with_label_values(&[reason])
                .inc_by(count);
        }
    }

    pub fn record_query(&self, outcome: &str) {
        self.queries_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_registration(&self, result: &str) {
        self.registrations_total.with_label_values(&[result]).inc();
    }

    /// Render all metrics in the text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::Error::Internal(format!("metrics encoding: {}", e)))
    }
}
