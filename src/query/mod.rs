//! Query evaluation with coverage gating
//!
//! A query resolves to one sketch instance (series identity + function) on
//! the owning partition. It is answered only when the instance's observed
//! interval spans the requested window; otherwise the caller gets
//! [`QueryOutcome::Pending`] and should retry later.

mod parser;
mod telemetry;

pub use parser::{parse, Expression};

use crate::clock::BoundedClock;
use crate::cluster::PartitionTable;
use crate::journal::{AggregationEvent, CoverageEvent, Journals};
use crate::metrics::ServerMetrics;
use crate::schema::{LabelSet, SeriesIdentity};
use crate::sketch::{AggregateFunction, CoverageState, EvalSample, Evaluated, SketchInstance};
use crate::{Error, Result};

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info_span, Instrument};

/// Configuration for the query path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// Longest a query waits for a sketch before answering pending
    pub coverage_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            coverage_timeout: Duration::from_millis(250),
        }
    }
}

/// A validated-on-evaluation query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub function: AggregateFunction,
    pub metric: String,
    pub labels: LabelSet,
    pub mint: i64,
    pub maxt: i64,
    pub arg: Option<f64>,
}

impl QueryRequest {
    pub fn identity(&self) -> SeriesIdentity {
        SeriesIdentity::new(&self.metric, self.labels.clone())
    }
}

/// Answered query
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub samples: Vec<EvalSample>,
    pub annotations: Vec<String>,
}

/// Why a query is not answerable yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PendingReason {
    /// No inserts for the series
    Uncovered,
    /// Inserts exist but do not span the window
    Partial { min_observed: i64, max_observed: i64 },
    /// The sketch could not be read within the coverage timeout
    Busy,
    /// The sketch has already dropped the start of the window
    Evicted,
}

impl PendingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingReason::Uncovered => "uncovered",
            PendingReason::Partial { .. } => "partial",
            PendingReason::Busy => "busy",
            PendingReason::Evicted => "evicted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Ready(QueryResult),
    Pending(PendingReason),
}

impl QueryOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, QueryOutcome::Pending(_))
    }
}

/// Drop "no data" sentinels, keeping source order.
fn filter_sentinels(samples: Vec<EvalSample>) -> Vec<EvalSample> {
    samples
        .into_iter()
        .filter(|s| !s.value.is_nan() && s.timestamp != 0)
        .collect()
}

pub struct QueryEvaluator {
    table: Arc<PartitionTable>,
    functions: Arc<[AggregateFunction]>,
    config: QueryConfig,
    clock: Arc<BoundedClock>,
    metrics: Arc<ServerMetrics>,
    journals: Arc<Journals>,
}

impl QueryEvaluator {
    pub fn new(
        table: Arc<PartitionTable>,
        functions: Arc<[AggregateFunction]>,
        config: QueryConfig,
        clock: Arc<BoundedClock>,
        metrics: Arc<ServerMetrics>,
        journals: Arc<Journals>,
    ) -> Self {
        Self {
            table,
            functions,
            config,
            clock,
            metrics,
            journals,
        }
    }

    fn check_function(&self, function: AggregateFunction) -> Result<()> {
        if self.functions.contains(&function) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "{} is not tracked by this server",
                function
            )))
        }
    }

    fn resolve(&self, identity: &SeriesIdentity, function: AggregateFunction) -> Option<Arc<SketchInstance>> {
        let snapshot = self.table.snapshot();
        let node = snapshot.node_for(identity.machine_id().ok()?)?;
        node.instance(identity, function)
    }

    /// Evaluate `request` over its explicit window.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryOutcome> {
        let span = info_span!(
            "query",
            function = %request.function,
            metric = %request.metric,
            mint = request.mint,
            maxt = request.maxt
        );
        let started = Instant::now();
        let result = self.query_inner(request, started).instrument(span).await;

        let outcome_label = match &result {
            Ok(QueryOutcome::Ready(_)) => "success",
            Ok(QueryOutcome::Pending(_)) => "pending",
            Err(e) if e.is_client_error() => "rejected",
            Err(_) => "error",
        };
        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.record_query(outcome_label);
        self.metrics
            .query_duration_seconds
            .with_label_values(&[request.function.as_str()])
            .observe(elapsed);
        telemetry::record_query(request.function.as_str(), outcome_label, elapsed);
        result
    }

    async fn query_inner(&self, request: &QueryRequest, started: Instant) -> Result<QueryOutcome> {
        let arg = request.function.validate_argument(request.arg)?;
        if request.mint > request.maxt {
            return Err(Error::Validation(format!(
                "mint {} is after maxt {}",
                request.mint, request.maxt
            )));
        }
        self.check_function(request.function)?;

        let identity = request.identity();
        identity.machine_id()?;
        let instance = self.resolve(&identity, request.function);

        let (state, observed) = match &instance {
            Some(inst) => (inst.coverage_state(request.mint, request.maxt), inst.observed()),
            None => (CoverageState::Uncovered, None),
        };
        self.journals.record_coverage(CoverageEvent {
            timestamp_ms: self.clock.now_millis(),
            function: request.function.to_string(),
            series: identity.to_string(),
            mint: request.mint,
            maxt: request.maxt,
            min_observed: observed.map(|o| o.0),
            max_observed: observed.map(|o| o.1),
            state: format!("{:?}", state).to_lowercase(),
        });

        let instance = match (state, instance, observed) {
            (CoverageState::Covered, Some(instance), _) => instance,
            (CoverageState::Partial, _, Some((min_observed, max_observed))) => {
                debug!(min_observed, max_observed, "Window not yet covered");
                let gap = min_observed
                    .saturating_sub(request.mint)
                    .max(0)
                    .saturating_add(request.maxt.saturating_sub(max_observed).max(0));
                telemetry::record_pending(request.function.as_str(), "partial", Some(gap as u64));
                return Ok(QueryOutcome::Pending(PendingReason::Partial {
                    min_observed,
                    max_observed,
                }));
            }
            _ => {
                debug!(series = %identity, "No data for series");
                telemetry::record_pending(request.function.as_str(), "uncovered", None);
                return Ok(QueryOutcome::Pending(PendingReason::Uncovered));
            }
        };

        let now = self.clock.now_millis();
        let evaluated = match instance
            .evaluate(arg, request.mint, request.maxt, now, self.config.coverage_timeout)
            .await?
        {
            Evaluated::Ready(evaluation) => Ok(evaluation),
            Evaluated::Busy => Err(PendingReason::Busy),
            Evaluated::Evicted => Err(PendingReason::Evicted),
        };
        let evaluation = match evaluated {
            Ok(evaluation) => evaluation,
            Err(reason) => {
                telemetry::record_pending(request.function.as_str(), reason.as_str(), None);
                return Ok(QueryOutcome::Pending(reason));
            }
        };

        let samples = filter_sentinels(evaluation.samples);
        self.journals.record_aggregation(AggregationEvent {
            timestamp_ms: now,
            function: request.function.to_string(),
            series: identity.to_string(),
            mint: request.mint,
            maxt: request.maxt,
            arg,
            samples: samples.len(),
            first_value: samples.first().map(|s| s.value),
            latency_us: started.elapsed().as_micros() as u64,
        });

        Ok(QueryOutcome::Ready(QueryResult {
            samples,
            annotations: evaluation.annotations,
        }))
    }

    /// Evaluate a parsed expression. The window ends at `time` when given,
    /// otherwise at the newest sample the series has seen.
    pub async fn query_expression(&self, expression: &Expression, time: Option<i64>) -> Result<QueryOutcome> {
        self.check_function(expression.function)?;
        let maxt = match time {
            Some(t) => t,
            None => {
                let identity = SeriesIdentity::new(&expression.metric, expression.labels.clone());
                // an unseen series evaluates at wall time and comes back uncovered
                self.resolve(&identity, expression.function)
                    .and_then(|inst| inst.observed())
                    .map(|(_, max)| max)
                    .unwrap_or_else(|| self.clock.now_millis())
            }
        };

        self.query(&QueryRequest {
            function: expression.function,
            metric: expression.metric.clone(),
            labels: expression.labels.clone(),
            mint: maxt.saturating_sub(expression.window_ms),
            maxt,
            arg: expression.arg,
        })
        .await
    }
}
