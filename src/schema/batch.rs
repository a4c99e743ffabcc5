//! Ingest batch wire format
//!
//! Exporters post `{"Timestamp": <ms>, "Metrics": [{"Name", "Labels", "Value"}]}`.
//! Lowercase field names are accepted too. `Value` is kept as raw JSON so that
//! one bad value fails only its own sample, never the whole body.

use super::{LabelSet, SeriesIdentity};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A batch as received on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestBatch {
    #[serde(rename = "Timestamp", alias = "timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Metrics", alias = "metrics", default)]
    pub metrics: Vec<RawMetric>,
}

/// One metric entry before validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMetric {
    #[serde(rename = "Name", alias = "name", default)]
    pub name: String,
    #[serde(rename = "Labels", alias = "labels", default)]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "Value", alias = "value", default)]
    pub value: serde_json::Value,
}

/// A validated sample ready for insertion
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub identity: SeriesIdentity,
    pub timestamp: i64,
    pub value: f64,
}

impl IngestBatch {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            metrics: Vec::new(),
        }
    }

    /// Append a metric; convenience for producers and tests.
    pub fn push<I, K, V>(&mut self, name: &str, labels: I, value: f64)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.metrics.push(RawMetric {
            name: name.to_string(),
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            value: serde_json::Number::from_f64(value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        });
    }

    /// Parse a request body. Structural problems are a validation error.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let batch: IngestBatch = serde_json::from_slice(body)
            .map_err(|e| Error::Validation(format!("malformed ingest body: {}", e)))?;
        batch.validate()?;
        Ok(batch)
    }

    /// Batch-level checks. Per-sample checks happen in [`RawMetric::to_sample`].
    pub fn validate(&self) -> Result<()> {
        if self.timestamp <= 0 {
            return Err(Error::Validation(format!(
                "batch timestamp must be positive, got {}",
                self.timestamp
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl RawMetric {
    /// Validate one entry against the batch timestamp.
    pub fn to_sample(&self, timestamp: i64) -> Result<MetricSample> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidSample("metric name is empty".to_string()));
        }

        let value = match &self.value {
            serde_json::Value::Number(n) => n.as_f64(),
            // exporters occasionally send numbers as strings
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            Error::InvalidSample(format!("{}: value {} is not numeric", self.name, self.value))
        })?;

        if !value.is_finite() {
            return Err(Error::InvalidSample(format!(
                "{}: value {} is not finite",
                self.name, value
            )));
        }

        let identity = SeriesIdentity::new(&self.name, LabelSet::from(&self.labels));
        identity.machine_id()?;
        Ok(MetricSample {
            identity,
            timestamp,
            value,
        })
    }

    /// Identity without validating the value, used for routing.
    pub fn identity(&self) -> SeriesIdentity {
        SeriesIdentity::new(&self.name, LabelSet::from(&self.labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MachineId;

    #[test]
    fn test_parse_capitalised_fields() {
        let body = br#"{"Timestamp": 1700000000000, "Metrics": [
            {"Name": "cpu", "Labels": {"machineid": "machine_3"}, "Value": 0.5}
        ]}"#;
        let batch = IngestBatch::from_slice(body).unwrap();
        assert_eq!(batch.timestamp, 1_700_000_000_000);
        let sample = batch.metrics[0].to_sample(batch.timestamp).unwrap();
        assert_eq!(sample.value, 0.5);
        assert_eq!(sample.identity.machine_id().unwrap(), MachineId(3));
    }

    #[test]
    fn test_parse_lowercase_aliases() {
        let body = br#"{"timestamp": 5, "metrics": [{"name": "m", "labels": {}, "value": 1}]}"#;
        let batch = IngestBatch::from_slice(body).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.metrics[0].to_sample(5).unwrap().value, 1.0);
    }

    #[test]
    fn test_malformed_body_is_validation_error() {
        let err = IngestBatch::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_non_positive_timestamp_rejected() {
        let err = IngestBatch::from_slice(br#"{"Timestamp": 0, "Metrics": []}"#).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_bad_value_fails_only_that_sample() {
        let body = br#"{"Timestamp": 10, "Metrics": [
            {"Name": "ok", "Labels": {}, "Value": 2.0},
            {"Name": "bad", "Labels": {}, "Value": "abc"},
            {"Name": "", "Labels": {}, "Value": 1.0},
            {"Name": "str", "Labels": {}, "Value": "3.5"}
        ]}"#;
        let batch = IngestBatch::from_slice(body).unwrap();
        let results: Vec<_> = batch.metrics.iter().map(|m| m.to_sample(10)).collect();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::InvalidSample(_))));
        assert!(matches!(results[2], Err(Error::InvalidSample(_))));
        assert_eq!(results[3].as_ref().unwrap().value, 3.5);
    }

    #[test]
    fn test_push_non_finite_becomes_invalid() {
        let mut batch = IngestBatch::new(1);
        batch.push("m", [("machineid", "machine_0")], f64::NAN);
        assert!(batch.metrics[0].to_sample(1).is_err());
    }
}
