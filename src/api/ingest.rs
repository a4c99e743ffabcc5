//! Ingest endpoints
//!
//! The control address routes each sample to its partition; a partition
//! address applies the whole batch to its own node. Both go through the
//! process-wide ingest gate and answer 200 whenever the body parsed, with
//! the success count in `ingested_metrics_count`. Only routed sub-batches
//! that never got a permit are reported as timed out.

use super::{error_response, ApiState, PartitionState};
use crate::ingester::IngestOutcome;
use crate::schema::IngestBatch;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub ingested_metrics_count: usize,
    pub failed_metrics_count: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub unrouted_metrics_count: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub timed_out_metrics_count: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl From<IngestOutcome> for IngestResponse {
    fn from(outcome: IngestOutcome) -> Self {
        Self {
            status: "success",
            ingested_metrics_count: outcome.ingested,
            failed_metrics_count: outcome.failed,
            unrouted_metrics_count: outcome.unrouted,
            timed_out_metrics_count: outcome.timed_out,
        }
    }
}

/// POST /ingest on the control address
pub async fn routed_ingest(State(state): State<ApiState>, body: Bytes) -> Response {
    let batch = match IngestBatch::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => return error_response(&e),
    };
    match state.router.ingest(batch).await {
        Ok(outcome) => Json(IngestResponse::from(outcome)).into_response(),
        Err(e) => {
            warn!(error = %e, "Routed ingest failed");
            error_response(&e)
        }
    }
}

/// POST /ingest on a partition address
pub async fn partition_ingest(State(state): State<PartitionState>, body: Bytes) -> Response {
    let batch = match IngestBatch::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => return error_response(&e),
    };
    match state.gate.apply(state.node.clone(), batch).await {
        Ok(outcome) => Json(IngestResponse::from(outcome)).into_response(),
        Err(e) => {
            warn!(partition = state.node.index(), error = %e, "Partition ingest failed");
            error_response(&e)
        }
    }
}

/// GET /debug-state on a partition address
pub async fn partition_debug_state(State(state): State<PartitionState>) -> Response {
    Json(state.node.report()).into_response()
}

/// GET /health on a partition address
pub async fn partition_health(State(state): State<PartitionState>) -> Response {
    let assignment = state.node.assignment();
    Json(serde_json::json!({
        "status": "ok",
        "partition": assignment.index,
        "port": assignment.port(),
        "machines": assignment.machines,
    }))
    .into_response()
}
