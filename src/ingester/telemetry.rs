//! Ingest path telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use std::sync::OnceLock;

struct IngestInstruments {
    gate_wait_seconds: Histogram<f64>,
    sub_batch_duration_seconds: Histogram<f64>,
    sub_batch_samples: Histogram<u64>,
    abandoned_samples: Counter<u64>,
    unrouted_samples: Counter<u64>,
}

fn instruments() -> &'static IngestInstruments {
    static INSTRUMENTS: OnceLock<IngestInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("promsketch.ingester");
        IngestInstruments {
            gate_wait_seconds: meter
                .f64_histogram("promsketch.ingester.gate.wait")
                .with_description("Time a sub-batch waited for an insert permit")
                .with_unit("s")
                .init(),
            sub_batch_duration_seconds: meter
                .f64_histogram("promsketch.ingester.sub_batch.duration")
                .with_description("Time spent applying one partition sub-batch")
                .with_unit("s")
                .init(),
            sub_batch_samples: meter
                .u64_histogram("promsketch.ingester.sub_batch.samples")
                .with_description("Samples per partition sub-batch")
                .init(),
            abandoned_samples: meter
                .u64_counter("promsketch.ingester.abandoned.samples")
                .with_description("Samples in sub-batches dropped while waiting for a permit")
                .init(),
            unrouted_samples: meter
                .u64_counter("promsketch.ingester.unrouted.samples")
                .with_description("Samples whose machine has no provisioned partition")
                .init(),
        }
    })
}

pub fn record_gate_wait(seconds: f64) {
    instruments().gate_wait_seconds.record(seconds, &[]);
}

pub fn record_sub_batch(duration_seconds: f64, samples: u64) {
    let i = instruments();
    i.sub_batch_duration_seconds.record(duration_seconds, &[]);
    i.sub_batch_samples.record(samples, &[]);
}

pub fn record_abandoned(samples: u64) {
    instruments().abandoned_samples.add(samples, &[]);
}

pub fn record_unrouted(samples: u64) {
    if samples > 0 {
        instruments().unrouted_samples.add(samples, &[]);
    }
}
