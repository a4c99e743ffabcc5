//! HTTP surfaces
//!
//! - The control address serves registration, routed ingest, queries, the
//!   aggregate debug view, Prometheus metrics and health.
//! - Every partition address serves its own ingest, debug section and health.

mod control;
mod ingest;
mod query;
mod telemetry;

use crate::clock::BoundedClock;
use crate::cluster::{ControlPlane, InProcessSpawner, ListenerSpawner, PartitionSpawner, PartitionTable};
use crate::config::ServerConfig;
use crate::ingester::{IngestGate, IngestRouter, NodeContext, PartitionNode};
use crate::journal::Journals;
use crate::metrics::ServerMetrics;
use crate::query::QueryEvaluator;
use crate::sharding::RoutingTable;
use crate::sketch::{SketchFactory, WindowedSketchFactory};
use crate::{Error, Result};
use telemetry::Surface;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

/// Maximum accepted request body
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// How partitions are made addressable
#[derive(Debug, Clone)]
pub enum SpawnMode {
    /// No per-partition listeners; everything goes through the control address
    InProcess,
    /// One listener per partition, stopped when the token is cancelled
    Listeners(CancellationToken),
}

/// Shared state of the control address
#[derive(Clone)]
pub struct ApiState {
    pub control: Arc<ControlPlane>,
    pub router: Arc<IngestRouter>,
    pub evaluator: Arc<QueryEvaluator>,
    pub gate: Arc<IngestGate>,
    pub metrics: Arc<ServerMetrics>,
    listeners: Option<Arc<ListenerSpawner>>,
}

impl ApiState {
    /// Wire every component from `config` with the reference sketch engine.
    pub fn build(config: &ServerConfig, journals: Arc<Journals>, mode: SpawnMode) -> Result<Self> {
        Self::build_with_factory(config, journals, mode, Arc::new(WindowedSketchFactory))
    }

    pub fn build_with_factory(
        config: &ServerConfig,
        journals: Arc<Journals>,
        mode: SpawnMode,
        factory: Arc<dyn SketchFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(ServerMetrics::new()?);
        let clock = Arc::new(BoundedClock::new());
        let functions: Arc<[_]> = config.functions.clone().into();

        let table = Arc::new(PartitionTable::new(RoutingTable::new(&config.routing)?));
        let gate = Arc::new(IngestGate::new(&config.ingest, metrics.clone()));

        let (spawner, listeners): (Arc<dyn PartitionSpawner>, _) = match mode {
            SpawnMode::InProcess => (Arc::new(InProcessSpawner), None),
            SpawnMode::Listeners(shutdown) => {
                let listeners = Arc::new(ListenerSpawner::new(gate.clone(), shutdown));
                (listeners.clone(), Some(listeners))
            }
        };

        let context = NodeContext {
            functions: functions.clone(),
            sketch: config.sketch,
            factory,
            clock: clock.clone(),
            metrics: metrics.clone(),
        };
        let control = Arc::new(ControlPlane::new(
            table.clone(),
            context,
            spawner,
            config.routing.max_partitions,
            config.prewarm_metric.clone(),
        ));
        let router = Arc::new(IngestRouter::new(
            table.clone(),
            gate.clone(),
            metrics.clone(),
        ));
        let evaluator = Arc::new(QueryEvaluator::new(
            table,
            functions,
            config.query.clone(),
            clock,
            metrics.clone(),
            journals,
        ));

        Ok(Self {
            control,
            router,
            evaluator,
            gate,
            metrics,
            listeners,
        })
    }

    pub fn table(&self) -> &Arc<PartitionTable> {
        self.control.table()
    }

    /// Stop admitting ingest work and wait for partition listeners to drain.
    /// Listener shutdown itself is driven by the token given to
    /// [`SpawnMode::Listeners`].
    pub async fn shutdown(&self) {
        self.gate.close();
        if let Some(listeners) = &self.listeners {
            listeners.join().await;
        }
    }
}

/// Shared state of one partition address
#[derive(Clone)]
pub struct PartitionState {
    pub node: Arc<PartitionNode>,
    pub gate: Arc<IngestGate>,
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Router for the control address
pub fn control_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(control::health))
        .route("/metrics", get(control::metrics))
        .route("/debug-state", get(control::debug_state))
        .route("/register_config", post(control::register_config))
        .route("/ingest", post(ingest::routed_ingest))
        .route("/parse", get(query::parse_expression))
        .route("/query", get(query::structured_query))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(middleware::from_fn_with_state(
            Surface::Control,
            telemetry::observe,
        ))
        .layer(cors())
}

/// Router for one partition address
pub fn partition_router(state: PartitionState) -> Router {
    let surface = Surface::Partition(state.node.index());
    Router::new()
        .route("/health", get(ingest::partition_health))
        .route("/debug-state", get(ingest::partition_debug_state))
        .route("/ingest", post(ingest::partition_ingest))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(middleware::from_fn_with_state(surface, telemetry::observe))
        .layer(cors())
}

/// Map an error onto 400 for caller mistakes and 500 otherwise.
pub(crate) fn error_response(error: &Error) -> Response {
    let status = if error.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "error": error.to_string(),
        })),
    )
        .into_response()
}
