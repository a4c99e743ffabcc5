//! Request spans and OTel instruments for both HTTP surfaces.
//!
//! Every request is tagged with the surface it arrived on. 202 answers are
//! counted separately: they are how the query path says "not covered yet",
//! not errors.

use axum::extract::{MatchedPath, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info_span, Instrument};

/// Which listener served a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Control,
    Partition(usize),
}

impl Surface {
    fn name(&self) -> &'static str {
        match self {
            Surface::Control => "control",
            Surface::Partition(_) => "partition",
        }
    }
}

struct HttpInstruments {
    requests: Counter<u64>,
    duration_seconds: Histogram<f64>,
    failures: Counter<u64>,
    deferred: Counter<u64>,
}

fn instruments() -> &'static HttpInstruments {
    static INSTRUMENTS: OnceLock<HttpInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("promsketch.api.http");
        HttpInstruments {
            requests: meter
                .u64_counter("http.server.request.count")
                .with_description("Requests handled, by surface and route")
                .init(),
            duration_seconds: meter
                .f64_histogram("http.server.request.duration")
                .with_description("Request latency")
                .with_unit("s")
                .init(),
            failures: meter
                .u64_counter("http.server.request.errors")
                .with_description("Requests answered with a 4xx or 5xx status")
                .init(),
            deferred: meter
                .u64_counter("promsketch.http.pending")
                .with_description("Queries answered 202 because the window is not covered yet")
                .init(),
        }
    })
}

fn attributes(surface: Surface, method: &str, route: &str, status: StatusCode) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new("promsketch.surface", surface.name()),
        KeyValue::new("http.request.method", method.to_string()),
        KeyValue::new("http.route", route.to_string()),
        KeyValue::new("http.response.status_code", status.as_u16() as i64),
    ];
    if let Surface::Partition(index) = surface {
        attrs.push(KeyValue::new("promsketch.partition", index as i64));
    }
    attrs
}

/// Wraps each request in an `http.request` span and records its outcome.
/// Install with `middleware::from_fn_with_state(surface, observe)`.
pub async fn observe(
    State(surface): State<Surface>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let span = info_span!(
        "http.request",
        otel.kind = "server",
        surface = surface.name(),
        http.request.method = %method,
        http.route = %route
    );
    let response = next.run(req).instrument(span).await;

    let status = response.status();
    let elapsed = started.elapsed().as_secs_f64();
    let attrs = attributes(surface, &method, &route, status);
    let instruments = instruments();
    instruments.requests.add(1, &attrs);
    instruments.duration_seconds.record(elapsed, &attrs);
    if status == StatusCode::ACCEPTED {
        instruments.deferred.add(1, &attrs);
    } else if status.is_client_error() || status.is_server_error() {
        instruments.failures.add(1, &attrs);
    }
    debug!(
        surface = surface.name(),
        route = %route,
        status = status.as_u16(),
        elapsed_ms = elapsed * 1000.0,
        "Request served"
    );

    response
}
