//! Series identity and ingest wire types
//!
//! Label mappings arrive as arbitrary key/value pairs. They are normalised
//! into a sorted, deduplicated [`LabelSet`] so that two identities compare and
//! hash equal exactly when their label pairs are equal as sets.

mod batch;
mod labels;

pub use batch::{IngestBatch, MetricSample, RawMetric};
pub use labels::{Label, LabelSet, MachineId, SeriesIdentity};

/// Label key carrying the metric name inside a series identity
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Label key carrying the machine identifier used for routing
pub const MACHINE_LABEL: &str = "machineid";

/// Prefix of machine identifiers produced by the exporters (`machine_<n>`)
pub const MACHINE_PREFIX: &str = "machine_";
