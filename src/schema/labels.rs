//! Label sets, series identities and machine identifiers

use super::{MACHINE_LABEL, MACHINE_PREFIX, METRIC_NAME_LABEL};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single label pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// Ordered, deduplicated association list of labels.
///
/// Pairs are kept sorted by name; setting an existing name replaces its value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelSet(Vec<Label>);

impl LabelSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build from `(name, value)` pairs. Later duplicates win.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut set = Self::new();
        for (name, value) in pairs {
            set.set(name, value);
        }
        set
    }

    /// Insert or replace a label.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.binary_search_by(|l| l.name.as_str().cmp(name.as_str())) {
            Ok(idx) => self.0[idx].value = value,
            Err(idx) => self.0.insert(idx, Label { name, value }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }
}

impl From<&BTreeMap<String, String>> for LabelSet {
    fn from(map: &BTreeMap<String, String>) -> Self {
        // BTreeMap iteration is already sorted and unique
        Self(
            map.iter()
                .map(|(name, value)| Label {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        )
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

/// Identity of one logical time series: the metric name merged into the
/// label set under [`METRIC_NAME_LABEL`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesIdentity(LabelSet);

impl SeriesIdentity {
    /// Merge `labels` with the metric name. The metric name always wins over
    /// a `__name__` label supplied by the caller.
    pub fn new(metric_name: &str, labels: LabelSet) -> Self {
        let mut labels = labels;
        labels.set(METRIC_NAME_LABEL, metric_name);
        Self(labels)
    }

    pub fn metric_name(&self) -> &str {
        self.0.get(METRIC_NAME_LABEL).unwrap_or_default()
    }

    /// Machine this series belongs to. Series without a machine label are
    /// routed with machine 0; a label that is not `machine_<n>` is rejected.
    pub fn machine_id(&self) -> Result<MachineId> {
        match self.0.get(MACHINE_LABEL) {
            None => Ok(MachineId::default()),
            Some(raw) => MachineId::parse(raw).ok_or_else(|| {
                Error::InvalidSample(format!(
                    "{}: {}={:?} is not a machine identifier",
                    self.metric_name(),
                    MACHINE_LABEL,
                    raw
                ))
            }),
        }
    }

    pub fn labels(&self) -> &LabelSet {
        &self.0
    }
}

impl fmt::Display for SeriesIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Numeric machine identifier used for range routing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId(pub u64);

impl MachineId {
    /// Parse `machine_<n>` (or a bare `<n>`).
    pub fn parse(raw: &str) -> Option<Self> {
        let digits = raw.strip_prefix(MACHINE_PREFIX).unwrap_or(raw);
        digits.trim().parse().ok().map(Self)
    }

    pub fn label_value(&self) -> String {
        format!("{}{}", MACHINE_PREFIX, self.0)
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", MACHINE_PREFIX, self.0)
    }
}
