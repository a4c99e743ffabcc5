//! Query-path OTel instruments.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct QueryInstruments {
    requests: Counter<u64>,
    duration_seconds: Histogram<f64>,
    pending: Counter<u64>,
    coverage_gap_ms: Histogram<u64>,
}

fn instruments() -> &'static QueryInstruments {
    static INSTRUMENTS: OnceLock<QueryInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("promsketch.query");
        QueryInstruments {
            requests: meter
                .u64_counter("promsketch.query.requests")
                .with_description("Queries by function and outcome")
                .init(),
            duration_seconds: meter
                .f64_histogram("promsketch.query.duration")
                .with_description("Query latency including the coverage check")
                .with_unit("s")
                .init(),
            pending: meter
                .u64_counter("promsketch.query.pending")
                .with_description("Queries deferred, by reason")
                .init(),
            coverage_gap_ms: meter
                .u64_histogram("promsketch.query.coverage_gap")
                .with_description("Part of a partially covered window outside the observed interval")
                .with_unit("ms")
                .init(),
        }
    })
}

pub fn record_query(function: &'static str, outcome: &'static str, duration_seconds: f64) {
    let attrs = [
        KeyValue::new("function", function),
        KeyValue::new("outcome", outcome),
    ];
    let i = instruments();
    i.requests.add(1, &attrs);
    i.duration_seconds.record(duration_seconds, &attrs);
}

/// `gap_ms` is only known for partially covered windows.
pub fn record_pending(function: &'static str, reason: &'static str, gap_ms: Option<u64>) {
    let attrs = [
        KeyValue::new("function", function),
        KeyValue::new("reason", reason),
    ];
    let i = instruments();
    i.pending.add(1, &attrs);
    if let Some(gap) = gap_ms {
        i.coverage_gap_ms.record(gap, &attrs);
    }
}
