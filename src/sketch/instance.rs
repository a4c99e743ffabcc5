//! A sketch engine bound to one (series, function) key, with its coverage
//! interval.
//!
//! Inserts take the engine's write lock, so inserts for one key are applied
//! one at a time in lock-acquisition order (tokio's `RwLock` is fair). The
//! coverage interval lives in atomics outside the lock: readers never wait on
//! an in-flight insert just to learn whether a window is covered.

use super::{AggregateFunction, Evaluation, SketchConfig, SketchEngine};
use crate::error::Result;
use crate::schema::SeriesIdentity;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Coverage of a query window by an instance's observed interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageState {
    /// No inserts yet
    Uncovered,
    /// Some inserts, window not fully spanned
    Partial,
    /// Observed interval spans the window
    Covered,
}

/// Point-in-time view of an instance for debug reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoverageSummary {
    pub min_observed: Option<i64>,
    pub max_observed: Option<i64>,
    pub inserts: u64,
    pub last_insert_ms: Option<i64>,
}

impl CoverageSummary {
    /// min > max can only be observed transiently while a first insert is
    /// publishing its bounds; a persistent one indicates a bug.
    pub fn is_consistent(&self) -> bool {
        match (self.min_observed, self.max_observed) {
            (Some(min), Some(max)) => min <= max,
            (None, None) => true,
            _ => false,
        }
    }
}

/// Result of trying to evaluate an instance
#[derive(Debug)]
pub enum Evaluated {
    Ready(Evaluation),
    /// Could not get at the engine within the coverage timeout
    Busy,
    /// The engine no longer holds state for the start of the window
    Evicted,
}

pub struct SketchInstance {
    identity: SeriesIdentity,
    function: AggregateFunction,
    config: SketchConfig,
    engine: RwLock<Box<dyn SketchEngine>>,
    min_observed: AtomicI64,
    max_observed: AtomicI64,
    inserts: AtomicU64,
    last_insert_ms: AtomicI64,
}

const UNSET_MIN: i64 = i64::MAX;
const UNSET_MAX: i64 = i64::MIN;

impl SketchInstance {
    pub fn new(
        identity: SeriesIdentity,
        function: AggregateFunction,
        config: SketchConfig,
        engine: Box<dyn SketchEngine>,
    ) -> Self {
        Self {
            identity,
            function,
            config,
            engine: RwLock::new(engine),
            min_observed: AtomicI64::new(UNSET_MIN),
            max_observed: AtomicI64::new(UNSET_MAX),
            inserts: AtomicU64::new(0),
            last_insert_ms: AtomicI64::new(0),
        }
    }

    pub fn identity(&self) -> &SeriesIdentity {
        &self.identity
    }

    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    pub fn config(&self) -> &SketchConfig {
        &self.config
    }

    /// Insert one sample and extend the coverage interval on success.
    ///
    /// `wall_ms` is recorded as the last-insert time for debug views.
    pub async fn insert(&self, timestamp: i64, value: f64, wall_ms: i64) -> Result<()> {
        let mut engine = self.engine.write().await;
        engine.insert(timestamp, value)?;
        // max first: a reader that sees min set always sees a max too
        self.max_observed.fetch_max(timestamp, Ordering::AcqRel);
        self.min_observed.fetch_min(timestamp, Ordering::AcqRel);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.last_insert_ms.store(wall_ms, Ordering::Relaxed);
        Ok(())
    }

    /// Observed interval, `None` before the first insert completes.
    pub fn observed(&self) -> Option<(i64, i64)> {
        let min = self.min_observed.load(Ordering::Acquire);
        let max = self.max_observed.load(Ordering::Acquire);
        if min == UNSET_MIN || max == UNSET_MAX {
            None
        } else {
            Some((min, max))
        }
    }

    pub fn coverage_state(&self, mint: i64, maxt: i64) -> CoverageState {
        match self.observed() {
            None => CoverageState::Uncovered,
            Some((min, max)) if min <= mint && maxt <= max => CoverageState::Covered,
            Some(_) => CoverageState::Partial,
        }
    }

    pub fn summary(&self) -> CoverageSummary {
        let min = self.min_observed.load(Ordering::Acquire);
        let max = self.max_observed.load(Ordering::Acquire);
        let last = self.last_insert_ms.load(Ordering::Relaxed);
        CoverageSummary {
            min_observed: (min != UNSET_MIN).then_some(min),
            max_observed: (max != UNSET_MAX).then_some(max),
            inserts: self.inserts.load(Ordering::Relaxed),
            last_insert_ms: (last != 0).then_some(last),
        }
    }

    /// Evaluate under a read lock. Gives up with [`Evaluated::Busy`] if the
    /// lock cannot be taken within `wait`. Never touches the coverage interval.
    pub async fn evaluate(
        &self,
        arg: Option<f64>,
        mint: i64,
        maxt: i64,
        now: i64,
        wait: Duration,
    ) -> Result<Evaluated> {
        let engine = match tokio::time::timeout(wait, self.engine.read()).await {
            Ok(guard) => guard,
            Err(_) => return Ok(Evaluated::Busy),
        };
        if !engine.is_covered(mint, maxt) {
            return Ok(Evaluated::Evicted);
        }
        let evaluation = engine.evaluate(self.function, arg, mint, maxt, now)?;
        Ok(Evaluated::Ready(evaluation))
    }
}

impl std::fmt::Debug for SketchInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SketchInstance")
            .field("identity", &self.identity)
            .field("function", &self.function)
            .field("observed", &self.observed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LabelSet;
    use crate::sketch::WindowedSketch;
    use std::sync::Arc;

    fn instance() -> SketchInstance {
        SketchInstance::new(
            SeriesIdentity::new("m", LabelSet::from_pairs([("machineid", "machine_0")])),
            AggregateFunction::AvgOverTime,
            SketchConfig::default(),
            Box::new(WindowedSketch::new(
                AggregateFunction::AvgOverTime,
                SketchConfig::default(),
            )),
        )
    }

    #[tokio::test]
    async fn test_coverage_state_machine() {
        let inst = instance();
        assert_eq!(inst.coverage_state(1000, 9000), CoverageState::Uncovered);

        inst.insert(1000, 1.0, 1).await.unwrap();
        assert_eq!(inst.coverage_state(1000, 9000), CoverageState::Partial);

        inst.insert(9000, 2.0, 2).await.unwrap();
        assert_eq!(inst.coverage_state(1000, 9000), CoverageState::Covered);
        assert_eq!(inst.coverage_state(500, 9000), CoverageState::Partial);
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_coverage() {
        let inst = instance();
        assert!(inst.insert(1000, f64::NAN, 1).await.is_err());
        assert_eq!(inst.observed(), None);
        assert_eq!(inst.summary().inserts, 0);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_track_bounds() {
        let inst = Arc::new(instance());
        let mut handles = Vec::new();
        for t in [5000i64, 2000, 8000, 3000, 7000] {
            let inst = inst.clone();
            handles.push(tokio::spawn(async move {
                inst.insert(t, 1.0, t).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(inst.observed(), Some((2000, 8000)));
        let summary = inst.summary();
        assert_eq!(summary.inserts, 5);
        assert!(summary.is_consistent());
    }

    #[tokio::test]
    async fn test_evaluate_busy_when_writer_holds_lock() {
        let inst = instance();
        inst.insert(1000, 1.0, 1).await.unwrap();
        let _writer = inst.engine.write().await;
        let out = inst
            .evaluate(None, 1000, 1000, 0, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(out, Evaluated::Busy));
    }

    #[tokio::test]
    async fn test_evaluate_does_not_move_coverage() {
        let inst = instance();
        inst.insert(1000, 1.0, 1).await.unwrap();
        inst.insert(2000, 3.0, 2).await.unwrap();
        let before = inst.summary();
        let out = inst
            .evaluate(None, 1000, 2000, 0, Duration::from_millis(50))
            .await
            .unwrap();
        match out {
            Evaluated::Ready(eval) => assert_eq!(eval.samples[0].value, 2.0),
            other => panic!("expected ready, got {:?}", other),
        }
        assert_eq!(inst.summary(), before);
    }
}
