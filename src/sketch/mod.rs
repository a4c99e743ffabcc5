//! Sketch engine seam
//!
//! The orchestration layer never looks inside a sketch. It talks to engines
//! through [`SketchEngine`] (insert, coverage, evaluate) and creates them
//! through a [`SketchFactory`], so any concrete summary can be swapped in.
//! [`WindowedSketch`] is the bundled engine, built on `datasketches`.

mod instance;
mod window;

pub use instance::{CoverageState, CoverageSummary, Evaluated, SketchInstance};
pub use window::{WindowedSketch, WindowedSketchFactory};

use crate::error::{Error, Result};
use crate::schema::SeriesIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Aggregation functions a sketch can answer over a time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    AvgOverTime,
    SumOverTime,
    CountOverTime,
    MinOverTime,
    MaxOverTime,
    QuantileOverTime,
    EntropyOverTime,
    L1OverTime,
    L2OverTime,
    DistinctOverTime,
    StddevOverTime,
    StdvarOverTime,
}

impl AggregateFunction {
    pub const ALL: [AggregateFunction; 12] = [
        AggregateFunction::AvgOverTime,
        AggregateFunction::SumOverTime,
        AggregateFunction::CountOverTime,
        AggregateFunction::MinOverTime,
        AggregateFunction::MaxOverTime,
        AggregateFunction::QuantileOverTime,
        AggregateFunction::EntropyOverTime,
        AggregateFunction::L1OverTime,
        AggregateFunction::L2OverTime,
        AggregateFunction::DistinctOverTime,
        AggregateFunction::StddevOverTime,
        AggregateFunction::StdvarOverTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::AvgOverTime => "avg_over_time",
            AggregateFunction::SumOverTime => "sum_over_time",
            AggregateFunction::CountOverTime => "count_over_time",
            AggregateFunction::MinOverTime => "min_over_time",
            AggregateFunction::MaxOverTime => "max_over_time",
            AggregateFunction::QuantileOverTime => "quantile_over_time",
            AggregateFunction::EntropyOverTime => "entropy_over_time",
            AggregateFunction::L1OverTime => "l1_over_time",
            AggregateFunction::L2OverTime => "l2_over_time",
            AggregateFunction::DistinctOverTime => "distinct_over_time",
            AggregateFunction::StddevOverTime => "stddev_over_time",
            AggregateFunction::StdvarOverTime => "stdvar_over_time",
        }
    }

    /// Whether the function takes a leading numeric argument.
    pub fn takes_argument(&self) -> bool {
        matches!(self, AggregateFunction::QuantileOverTime)
    }

    /// Check the numeric argument before any evaluation happens.
    pub fn validate_argument(&self, arg: Option<f64>) -> Result<Option<f64>> {
        match (self, arg) {
            (AggregateFunction::QuantileOverTime, Some(q)) => {
                if q.is_finite() && (0.0..=1.0).contains(&q) {
                    Ok(Some(q))
                } else {
                    Err(Error::ArgumentOutOfRange {
                        function: self.as_str().to_string(),
                        value: q,
                        expected: "a rank in [0, 1]",
                    })
                }
            }
            (AggregateFunction::QuantileOverTime, None) => Err(Error::Validation(
                "quantile_over_time requires a rank argument".to_string(),
            )),
            (_, Some(_)) => Err(Error::Validation(format!(
                "{} does not take a numeric argument",
                self.as_str()
            ))),
            (_, None) => Ok(None),
        }
    }

    /// Parse a comma separated list, as used by `--functions`.
    pub fn parse_list(raw: &str) -> Result<Vec<AggregateFunction>> {
        let mut out = Vec::new();
        for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let func: AggregateFunction = name.parse()?;
            if !out.contains(&func) {
                out.push(func);
            }
        }
        Ok(out)
    }
}

impl FromStr for AggregateFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AggregateFunction::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| Error::UnknownFunction(s.to_string()))
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instance configuration, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SketchConfig {
    /// Time window retained by the engine (ms)
    pub time_window_ms: i64,
    /// Maximum number of items retained by the engine
    pub item_window: usize,
    /// Expected number of distinct values; sizes frequency summaries
    pub value_scale: u64,
    /// Width of one time bucket (ms). Eviction and window selection work on
    /// whole buckets.
    #[serde(default = "default_bucket_ms")]
    pub bucket_ms: i64,
}

fn default_bucket_ms() -> i64 {
    1000
}

impl Default for SketchConfig {
    fn default() -> Self {
        Self {
            time_window_ms: 60_000,
            item_window: 100_000,
            value_scale: 10_000,
            bucket_ms: default_bucket_ms(),
        }
    }
}

/// One evaluated point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalSample {
    pub value: f64,
    pub timestamp: i64,
}

/// Raw engine output, before sentinel filtering
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub samples: Vec<EvalSample>,
    pub annotations: Vec<String>,
}

impl Evaluation {
    pub fn single(value: f64, timestamp: i64) -> Self {
        Self {
            samples: vec![EvalSample { value, timestamp }],
            annotations: Vec::new(),
        }
    }
}

/// An approximate summary for one (series, function) pair.
///
/// Implementations may assume inserts for one instance arrive serialized and
/// in non-decreasing timestamp order.
pub trait SketchEngine: Send + Sync {
    fn insert(&mut self, timestamp: i64, value: f64) -> Result<()>;

    /// Whether the engine still holds enough state to answer `[mint, maxt]`.
    /// Engines that never evict can keep the default.
    fn is_covered(&self, _mint: i64, _maxt: i64) -> bool {
        true
    }

    /// Evaluate `function` over `[mint, maxt]`. `now` is the wall clock in ms
    /// for engines that decay aged state.
    fn evaluate(
        &self,
        function: AggregateFunction,
        arg: Option<f64>,
        mint: i64,
        maxt: i64,
        now: i64,
    ) -> Result<Evaluation>;
}

/// Creates engines for new sketch instances
pub trait SketchFactory: Send + Sync {
    fn create(
        &self,
        identity: &SeriesIdentity,
        function: AggregateFunction,
        config: &SketchConfig,
    ) -> Result<Box<dyn SketchEngine>>;
}
