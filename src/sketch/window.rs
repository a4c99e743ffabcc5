//! Bundled sketch engine: time-bucketed mergeable summaries
//!
//! Samples land in fixed-width time buckets. A bucket keeps only the summary
//! its function needs: running moments, a KLL quantile sketch, a CPC
//! distinct-count sketch or a frequent-items sketch. Raw samples are never
//! retained. A query merges the buckets overlapping its window.
//!
//! Eviction drops whole buckets, oldest first, once they fall out of the time
//! window or the newer buckets already hold a full item window.

use super::{AggregateFunction, Evaluation, SketchConfig, SketchEngine, SketchFactory};
use crate::error::{Error, Result};
use crate::schema::SeriesIdentity;
use datasketches::cpc::{CpcSketch, CpcUnion};
use datasketches::frequencies::{ErrorType, FrequentItemsSketch};
use datasketches::kll::{KllSketch, DEFAULT_K};
use std::collections::VecDeque;

/// Log2 of the CPC sketch size; ~2% relative error.
const CPC_LG_K: u8 = 11;
/// Smallest and largest frequent-items map.
const MIN_FREQUENCY_MAP: usize = 8;
const MAX_FREQUENCY_MAP: usize = 1 << 16;
/// Item-window granularity: a bucket holds at most `item_window / ITEM_SLICES`
/// items before the next one opens.
const ITEM_SLICES: usize = 64;

/// Which summary a function is answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SummaryKind {
    Moments,
    Quantiles,
    Distinct,
    Frequencies,
}

impl SummaryKind {
    fn for_function(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::AvgOverTime
            | AggregateFunction::SumOverTime
            | AggregateFunction::CountOverTime
            | AggregateFunction::MinOverTime
            | AggregateFunction::MaxOverTime
            | AggregateFunction::StddevOverTime
            | AggregateFunction::StdvarOverTime => SummaryKind::Moments,
            AggregateFunction::QuantileOverTime => SummaryKind::Quantiles,
            AggregateFunction::DistinctOverTime => SummaryKind::Distinct,
            AggregateFunction::EntropyOverTime
            | AggregateFunction::L1OverTime
            | AggregateFunction::L2OverTime => SummaryKind::Frequencies,
        }
    }
}

/// Count, mean and squared deviations (Welford), plus extremes.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Moments {
    count: u64,
    mean: f64,
    m2: f64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for Moments {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Moments {
    fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Chan et al. pairwise combination.
    fn merge(&mut self, other: &Moments) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n = (self.count + other.count) as f64;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / n;
        self.m2 += other.m2 + delta * delta * self.count as f64 * other.count as f64 / n;
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    fn variance(&self) -> f64 {
        self.m2 / self.count as f64
    }
}

enum Summary {
    Moments(Moments),
    Quantiles(KllSketch<f64>),
    Distinct(CpcSketch),
    Frequencies(FrequentItemsSketch<u64>),
}

/// Hash and frequency key for a value; folds -0.0 into 0.0.
fn value_key(value: f64) -> u64 {
    if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

impl Summary {
    fn new(kind: SummaryKind, frequency_map: usize) -> Self {
        match kind {
            SummaryKind::Moments => Summary::Moments(Moments::default()),
            SummaryKind::Quantiles => Summary::Quantiles(KllSketch::new(DEFAULT_K)),
            SummaryKind::Distinct => Summary::Distinct(CpcSketch::new(CPC_LG_K)),
            SummaryKind::Frequencies => Summary::Frequencies(FrequentItemsSketch::new(frequency_map)),
        }
    }

    fn update(&mut self, value: f64) {
        match self {
            Summary::Moments(m) => m.update(value),
            Summary::Quantiles(kll) => kll.update(value),
            Summary::Distinct(cpc) => cpc.update(value_key(value)),
            Summary::Frequencies(freq) => freq.update(value_key(value)),
        }
    }
}

struct Bucket {
    /// Aligned start of the bucket's time slot
    slot: i64,
    min_t: i64,
    max_t: i64,
    items: usize,
    summary: Summary,
}

impl Bucket {
    fn overlaps(&self, mint: i64, maxt: i64) -> bool {
        self.max_t >= mint && self.min_t <= maxt
    }
}

pub struct WindowedSketch {
    config: SketchConfig,
    kind: SummaryKind,
    frequency_map: usize,
    bucket_capacity: usize,
    /// Ordered by slot
    buckets: VecDeque<Bucket>,
    items: usize,
    newest: Option<i64>,
    /// Largest timestamp dropped by eviction
    evicted_through: Option<i64>,
}

impl WindowedSketch {
    pub fn new(function: AggregateFunction, config: SketchConfig) -> Self {
        let frequency_map = (config.value_scale as usize)
            .clamp(MIN_FREQUENCY_MAP, MAX_FREQUENCY_MAP)
            .next_power_of_two();
        Self {
            config,
            kind: SummaryKind::for_function(function),
            frequency_map,
            bucket_capacity: (config.item_window / ITEM_SLICES).max(1),
            buckets: VecDeque::new(),
            items: 0,
            newest: None,
            evicted_through: None,
        }
    }

    /// Items currently summarized
    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn new_bucket(&self, slot: i64, timestamp: i64) -> Bucket {
        Bucket {
            slot,
            min_t: timestamp,
            max_t: timestamp,
            items: 0,
            summary: Summary::new(self.kind, self.frequency_map),
        }
    }

    /// Bucket a sample at `timestamp` belongs to, opening one if needed.
    fn bucket_for(&mut self, timestamp: i64) -> &mut Bucket {
        let slot = timestamp.div_euclid(self.config.bucket_ms) * self.config.bucket_ms;
        let idx = match self.buckets.back() {
            Some(last) if last.slot == slot && last.items < self.bucket_capacity => {
                self.buckets.len() - 1
            }
            Some(last) if last.slot > slot => {
                // late sample: fold into the newest bucket at or before its slot
                match self.buckets.partition_point(|b| b.slot <= slot) {
                    0 => {
                        let bucket = self.new_bucket(slot, timestamp);
                        self.buckets.push_front(bucket);
                        0
                    }
                    n => n - 1,
                }
            }
            _ => {
                let bucket = self.new_bucket(slot, timestamp);
                self.buckets.push_back(bucket);
                self.buckets.len() - 1
            }
        };
        &mut self.buckets[idx]
    }

    fn evict(&mut self) {
        let Some(newest) = self.newest else {
            return;
        };
        let cutoff = newest.saturating_sub(self.config.time_window_ms);
        while let Some(front) = self.buckets.front() {
            let aged_out = front.max_t < cutoff;
            let over_items = self.buckets.len() > 1
                && self.items - front.items >= self.config.item_window;
            if !aged_out && !over_items {
                break;
            }
            if let Some(dropped) = self.buckets.pop_front() {
                self.items -= dropped.items;
                self.evicted_through = Some(
                    self.evicted_through
                        .map_or(dropped.max_t, |e| e.max(dropped.max_t)),
                );
            }
        }
    }

    fn window(&self, mint: i64, maxt: i64) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter().filter(move |b| b.overlaps(mint, maxt))
    }

    fn merged_moments(&self, mint: i64, maxt: i64) -> Moments {
        let mut merged = Moments::default();
        for bucket in self.window(mint, maxt) {
            if let Summary::Moments(m) = &bucket.summary {
                merged.merge(m);
            }
        }
        merged
    }

    fn merged_quantiles(&self, mint: i64, maxt: i64) -> KllSketch<f64> {
        let mut merged = KllSketch::new(DEFAULT_K);
        for bucket in self.window(mint, maxt) {
            if let Summary::Quantiles(kll) = &bucket.summary {
                merged.merge(kll);
            }
        }
        merged
    }

    fn merged_distinct(&self, mint: i64, maxt: i64) -> CpcSketch {
        let mut union = CpcUnion::new(CPC_LG_K);
        for bucket in self.window(mint, maxt) {
            if let Summary::Distinct(cpc) = &bucket.summary {
                union.update(cpc);
            }
        }
        union.to_sketch()
    }

    fn merged_frequencies(&self, mint: i64, maxt: i64) -> FrequentItemsSketch<u64> {
        let mut merged = FrequentItemsSketch::new(self.frequency_map);
        for bucket in self.window(mint, maxt) {
            if let Summary::Frequencies(freq) = &bucket.summary {
                merged.merge(freq);
            }
        }
        merged
    }
}

/// Prometheus-style interpolation between closest ranks. Exact while the
/// sketch is below its compaction threshold.
fn interpolated_quantile(sketch: &KllSketch<f64>, q: f64) -> Option<f64> {
    let n = sketch.n();
    if n == 0 {
        return None;
    }
    // item i is the smallest item whose inclusive rank reaches (i + 0.5) / n
    let item = |i: f64| sketch.quantile(((i + 0.5) / n as f64).min(1.0), true);
    let rank = q * (n - 1) as f64;
    let lower = rank.floor();
    let weight = rank - lower;
    let low = item(lower)?;
    if weight == 0.0 {
        return Some(low);
    }
    let high = item((lower + 1.0).min((n - 1) as f64))?;
    Some(low * (1.0 - weight) + high * weight)
}

/// Entropy and L2 norm over the tracked value frequencies.
fn frequency_norms(sketch: &FrequentItemsSketch<u64>) -> (f64, f64) {
    let total = sketch.total_weight() as f64;
    let mut squares = 0.0;
    let mut weighted = 0.0;
    for row in sketch.frequent_items(ErrorType::NoFalseNegatives) {
        let f = row.estimate() as f64;
        squares += f * f;
        weighted += f * f.log2();
    }
    (total.log2() - weighted / total, squares.sqrt())
}

impl SketchEngine for WindowedSketch {
    fn insert(&mut self, timestamp: i64, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(Error::Sketch(format!("non-finite value {}", value)));
        }
        let bucket = self.bucket_for(timestamp);
        bucket.summary.update(value);
        bucket.items += 1;
        bucket.min_t = bucket.min_t.min(timestamp);
        bucket.max_t = bucket.max_t.max(timestamp);
        self.items += 1;
        self.newest = Some(self.newest.map_or(timestamp, |n| n.max(timestamp)));
        self.evict();
        Ok(())
    }

    fn is_covered(&self, mint: i64, _maxt: i64) -> bool {
        self.evicted_through.map_or(true, |e| mint > e)
    }

    fn evaluate(
        &self,
        function: AggregateFunction,
        arg: Option<f64>,
        mint: i64,
        maxt: i64,
        _now: i64,
    ) -> Result<Evaluation> {
        if SummaryKind::for_function(function) != self.kind {
            return Err(Error::Sketch(format!(
                "{} cannot be answered from a {:?} summary",
                function, self.kind
            )));
        }
        if self.window(mint, maxt).next().is_none() {
            return Ok(Evaluation::single(f64::NAN, maxt));
        }

        let mut annotations = Vec::new();
        let value = match self.kind {
            SummaryKind::Moments => {
                let m = self.merged_moments(mint, maxt);
                match function {
                    AggregateFunction::AvgOverTime => m.mean,
                    AggregateFunction::SumOverTime => m.sum,
                    AggregateFunction::CountOverTime => m.count as f64,
                    AggregateFunction::MinOverTime => m.min,
                    AggregateFunction::MaxOverTime => m.max,
                    AggregateFunction::StdvarOverTime => m.variance(),
                    _ => m.variance().sqrt(),
                }
            }
            SummaryKind::Quantiles => {
                let q = arg.ok_or_else(|| {
                    Error::Validation("quantile_over_time requires a rank argument".to_string())
                })?;
                let kll = self.merged_quantiles(mint, maxt);
                if kll.is_estimation_mode() {
                    annotations.push(format!(
                        "approximate quantile: normalized rank error {:.4}",
                        kll.normalized_rank_error(false)
                    ));
                }
                interpolated_quantile(&kll, q).unwrap_or(f64::NAN)
            }
            SummaryKind::Distinct => {
                let cpc = self.merged_distinct(mint, maxt);
                cpc.estimate().round()
            }
            SummaryKind::Frequencies => {
                let freq = self.merged_frequencies(mint, maxt);
                if freq.maximum_error() > 0 {
                    annotations.push(format!(
                        "approximate frequencies: maximum error {}",
                        freq.maximum_error()
                    ));
                }
                match function {
                    AggregateFunction::L1OverTime => freq.total_weight() as f64,
                    AggregateFunction::L2OverTime => frequency_norms(&freq).1,
                    _ => frequency_norms(&freq).0,
                }
            }
        };

        let mut evaluation = Evaluation::single(value, maxt);
        evaluation.annotations = annotations;
        Ok(evaluation)
    }
}

/// Factory producing [`WindowedSketch`] engines
#[derive(Debug, Clone, Default)]
pub struct WindowedSketchFactory;

impl SketchFactory for WindowedSketchFactory {
    fn create(
        &self,
        _identity: &SeriesIdentity,
        function: AggregateFunction,
        config: &SketchConfig,
    ) -> Result<Box<dyn SketchEngine>> {
        if config.time_window_ms <= 0 || config.item_window == 0 || config.bucket_ms <= 0 {
            return Err(Error::Sketch(format!(
                "invalid sketch window: time_window_ms={} item_window={} bucket_ms={}",
                config.time_window_ms, config.item_window, config.bucket_ms
            )));
        }
        Ok(Box::new(WindowedSketch::new(function, *config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(function: AggregateFunction, values: &[(i64, f64)]) -> WindowedSketch {
        let mut sketch = WindowedSketch::new(function, SketchConfig::default());
        for (t, v) in values {
            sketch.insert(*t, *v).unwrap();
        }
        sketch
    }

    fn eval(func: AggregateFunction, arg: Option<f64>, values: &[(i64, f64)]) -> f64 {
        filled(func, values)
            .evaluate(func, arg, 0, 10_000, 0)
            .unwrap()
            .samples[0]
            .value
    }

    const RAMP: [(i64, f64); 4] = [(1000, 1.0), (2000, 2.0), (3000, 3.0), (4000, 4.0)];

    #[test]
    fn test_moment_aggregates() {
        assert_eq!(eval(AggregateFunction::AvgOverTime, None, &RAMP), 2.5);
        assert_eq!(eval(AggregateFunction::SumOverTime, None, &RAMP), 10.0);
        assert_eq!(eval(AggregateFunction::CountOverTime, None, &RAMP), 4.0);
        assert_eq!(eval(AggregateFunction::MinOverTime, None, &RAMP), 1.0);
        assert_eq!(eval(AggregateFunction::MaxOverTime, None, &RAMP), 4.0);
        assert!((eval(AggregateFunction::StdvarOverTime, None, &RAMP) - 1.25).abs() < 1e-9);
        assert!(
            (eval(AggregateFunction::StddevOverTime, None, &RAMP) - 1.25f64.sqrt()).abs() < 1e-9
        );
    }

    #[test]
    fn test_moments_merge_matches_single_pass() {
        let mut whole = Moments::default();
        let mut left = Moments::default();
        let mut right = Moments::default();
        for (i, v) in [3.0, 7.5, -2.0, 11.0, 4.25, 0.5].iter().enumerate() {
            whole.update(*v);
            if i < 2 {
                left.update(*v);
            } else {
                right.update(*v);
            }
        }
        left.merge(&right);
        assert_eq!(left.count, whole.count);
        assert!((left.mean - whole.mean).abs() < 1e-9);
        assert!((left.variance() - whole.variance()).abs() < 1e-9);
        assert_eq!(left.min, -2.0);
        assert_eq!(left.max, 11.0);
    }

    #[test]
    fn test_quantile_interpolates() {
        let values = [(1000, 10.0), (2000, 20.0), (3000, 30.0), (4000, 40.0), (5000, 50.0)];
        let q = AggregateFunction::QuantileOverTime;
        assert_eq!(eval(q, Some(0.5), &values), 30.0);
        assert_eq!(eval(q, Some(0.0), &values), 10.0);
        assert_eq!(eval(q, Some(1.0), &values), 50.0);
        assert!((eval(q, Some(0.9), &values) - 46.0).abs() < 1e-9);
    }

    #[test]
    fn test_quantile_stays_close_past_compaction() {
        let q = AggregateFunction::QuantileOverTime;
        let mut sketch = WindowedSketch::new(
            q,
            SketchConfig {
                item_window: 1_000_000,
                ..SketchConfig::default()
            },
        );
        for i in 0..50_000i64 {
            sketch.insert(i, (i % 1000) as f64).unwrap();
        }
        let out = sketch.evaluate(q, Some(0.5), 0, 50_000, 0).unwrap();
        assert!((out.samples[0].value - 500.0).abs() < 30.0);
        assert!(!out.annotations.is_empty());
    }

    #[test]
    fn test_frequency_functions() {
        let values = [(1000, 1.0), (2000, 1.0), (3000, 2.0), (4000, 2.0)];
        assert_eq!(eval(AggregateFunction::DistinctOverTime, None, &values), 2.0);
        assert_eq!(eval(AggregateFunction::L1OverTime, None, &values), 4.0);
        assert!((eval(AggregateFunction::L2OverTime, None, &values) - 8f64.sqrt()).abs() < 1e-9);
        assert!((eval(AggregateFunction::EntropyOverTime, None, &values) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_zero_counts_as_zero() {
        let values = [(1000, 0.0), (2000, -0.0)];
        assert_eq!(eval(AggregateFunction::DistinctOverTime, None, &values), 1.0);
        assert!((eval(AggregateFunction::EntropyOverTime, None, &values)).abs() < 1e-9);
    }

    #[test]
    fn test_memory_is_bounded_by_buckets() {
        let avg = AggregateFunction::AvgOverTime;
        let mut sketch = WindowedSketch::new(avg, SketchConfig::default());
        for i in 0..50_000i64 {
            sketch.insert(i, 1.0).unwrap();
        }
        // 50 one-second buckets, each a handful of counters
        assert_eq!(sketch.bucket_count(), 50);
        assert_eq!(sketch.len(), 50_000);
        let out = sketch.evaluate(avg, None, 0, 50_000, 0).unwrap();
        assert_eq!(out.samples[0].value, 1.0);
    }

    #[test]
    fn test_empty_window_yields_nan() {
        let sketch = filled(AggregateFunction::AvgOverTime, &[(1000, 1.0)]);
        let out = sketch
            .evaluate(AggregateFunction::AvgOverTime, None, 5000, 6000, 0)
            .unwrap();
        assert!(out.samples[0].value.is_nan());
    }

    #[test]
    fn test_window_selects_buckets() {
        let sketch = filled(AggregateFunction::SumOverTime, &RAMP);
        let out = sketch
            .evaluate(AggregateFunction::SumOverTime, None, 2000, 3000, 0)
            .unwrap();
        assert_eq!(out.samples[0].value, 5.0);
        assert_eq!(out.samples[0].timestamp, 3000);
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut sketch = WindowedSketch::new(AggregateFunction::AvgOverTime, SketchConfig::default());
        assert!(sketch.insert(1, f64::INFINITY).is_err());
        assert!(sketch.is_empty());
    }

    #[test]
    fn test_rejects_function_of_other_summary() {
        let sketch = filled(AggregateFunction::AvgOverTime, &RAMP);
        assert!(sketch
            .evaluate(AggregateFunction::QuantileOverTime, Some(0.5), 0, 10_000, 0)
            .is_err());
    }

    #[test]
    fn test_item_window_eviction() {
        let mut sketch = WindowedSketch::new(
            AggregateFunction::AvgOverTime,
            SketchConfig {
                item_window: 3,
                ..SketchConfig::default()
            },
        );
        for t in 1..=5 {
            sketch.insert(t * 1000, t as f64).unwrap();
        }
        assert_eq!(sketch.len(), 3);
        assert!(!sketch.is_covered(1000, 5000));
        assert!(sketch.is_covered(3000, 5000));
    }

    #[test]
    fn test_time_window_eviction() {
        let mut sketch = WindowedSketch::new(
            AggregateFunction::AvgOverTime,
            SketchConfig {
                time_window_ms: 1000,
                bucket_ms: 100,
                ..SketchConfig::default()
            },
        );
        sketch.insert(0, 1.0).unwrap();
        sketch.insert(500, 1.0).unwrap();
        sketch.insert(2000, 1.0).unwrap();
        assert_eq!(sketch.len(), 1);
        assert!(!sketch.is_covered(500, 2000));
        assert!(sketch.is_covered(1500, 2000));
    }

    #[test]
    fn test_late_sample_joins_earlier_bucket() {
        let sketch = filled(
            AggregateFunction::MinOverTime,
            &[(1000, 5.0), (3000, 7.0), (1500, 2.0)],
        );
        assert_eq!(sketch.bucket_count(), 2);
        let out = sketch
            .evaluate(AggregateFunction::MinOverTime, None, 1000, 2000, 0)
            .unwrap();
        assert_eq!(out.samples[0].value, 2.0);
    }

    #[test]
    fn test_factory_rejects_zero_window() {
        let identity = SeriesIdentity::new("m", Default::default());
        let config = SketchConfig {
            item_window: 0,
            ..SketchConfig::default()
        };
        assert!(WindowedSketchFactory
            .create(&identity, AggregateFunction::AvgOverTime, &config)
            .is_err());
    }
}
