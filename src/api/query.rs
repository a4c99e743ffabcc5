//! Query endpoints
//!
//! `/parse` takes an expression; `/query` takes the parts as parameters
//! with an explicit window. Covered windows answer 200, uncovered ones 202.

use super::{error_response, ApiState};
use crate::query::{self as eval, PendingReason, QueryOutcome, QueryRequest};
use crate::schema::LabelSet;
use crate::sketch::{AggregateFunction, EvalSample};
use crate::{Error, Result};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

const PENDING_MESSAGE: &str = "Sketch data not yet available. Try again later.";
const LABEL_PREFIX: &str = "label_";

#[derive(Debug, Serialize)]
struct SuccessResponse {
    status: &'static str,
    data: Vec<EvalSample>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    annotations: Vec<String>,
    query_latency_ms: f64,
}

#[derive(Debug, Serialize)]
struct PendingResponse {
    status: &'static str,
    message: &'static str,
    #[serde(flatten)]
    reason: PendingReason,
    query_latency_ms: f64,
}

fn outcome_response(outcome: QueryOutcome, started: Instant) -> Response {
    let query_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    match outcome {
        QueryOutcome::Ready(result) => Json(SuccessResponse {
            status: "success",
            data: result.samples,
            annotations: result.annotations,
            query_latency_ms,
        })
        .into_response(),
        QueryOutcome::Pending(reason) => (
            StatusCode::ACCEPTED,
            Json(PendingResponse {
                status: "pending",
                message: PENDING_MESSAGE,
                reason,
                query_latency_ms,
            }),
        )
            .into_response(),
    }
}

fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::Validation(format!("missing query parameter '{}'", key)))
}

fn integer(params: &HashMap<String, String>, key: &str) -> Result<Option<i64>> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<i64>().map(Some).map_err(|_| {
            Error::Validation(format!("'{}' must be an integer millisecond timestamp, got '{}'", key, raw))
        }),
    }
}

/// GET /parse?q=<expr>[&time=<ms>]
pub async fn parse_expression(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let started = Instant::now();
    let result = async {
        let expression = eval::parse(required(&params, "q")?)?;
        let time = integer(&params, "time")?;
        state.evaluator.query_expression(&expression, time).await
    }
    .await;

    match result {
        Ok(outcome) => outcome_response(outcome, started),
        Err(e) => error_response(&e),
    }
}

fn structured_request(params: &HashMap<String, String>) -> Result<QueryRequest> {
    let function: AggregateFunction = required(params, "func")?.parse()?;
    let metric = required(params, "metric")?.to_string();
    let mint = integer(params, "mint")?
        .ok_or_else(|| Error::Validation("missing query parameter 'mint'".to_string()))?;
    let maxt = integer(params, "maxt")?
        .ok_or_else(|| Error::Validation("missing query parameter 'maxt'".to_string()))?;

    // clients send args for every function; only functions that take one read it
    let arg = match params.get("args") {
        Some(raw) if function.takes_argument() => Some(raw.trim().parse::<f64>().map_err(|_| {
            Error::Validation(format!("'args' must be numeric, got '{}'", raw))
        })?),
        _ => None,
    };

    let labels = LabelSet::from_pairs(
        params
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(LABEL_PREFIX).map(|name| (name, v.as_str())))
            .filter(|(name, _)| !name.is_empty()),
    );

    Ok(QueryRequest {
        function,
        metric,
        labels,
        mint,
        maxt,
        arg,
    })
}

/// GET /query?func=&metric=&mint=&maxt=[&args=][&label_<k>=<v>...]
pub async fn structured_query(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let started = Instant::now();
    let result = match structured_request(&params) {
        Ok(request) => state.evaluator.query(&request).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(outcome) => outcome_response(outcome, started),
        Err(e) => error_response(&e),
    }
}
