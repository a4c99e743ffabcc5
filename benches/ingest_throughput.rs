//! Ingest throughput benchmark

use promsketch::api::{ApiState, SpawnMode};
use promsketch::cluster::RegisterRequest;
use promsketch::config::ServerConfig;
use promsketch::journal::Journals;
use promsketch::schema::IngestBatch;
use promsketch::sketch::AggregateFunction;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

const MACHINES: u64 = 800;

fn create_batch(timestamp: i64, machines: u64) -> IngestBatch {
    let mut batch = IngestBatch::new(timestamp);
    for m in 0..machines {
        let machine = format!("machine_{}", m);
        batch.push(
            "cpu_usage",
            [("machineid", machine.as_str()), ("core", "0")],
            (m % 100) as f64 / 100.0,
        );
    }
    batch
}

fn build_state(rt: &Runtime, functions: Vec<AggregateFunction>) -> ApiState {
    let mut config = ServerConfig::default();
    config.functions = functions;
    config.partition_listeners = false;
    let state = ApiState::build(&config, Arc::new(Journals::disabled()), SpawnMode::InProcess)
        .expect("state");
    rt.block_on(state.control.register_config(RegisterRequest {
        estimated_timeseries: MACHINES,
        machines_per_port: None,
    }))
    .expect("register");
    state
}

fn bench_routed_ingest(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("routed_ingest");

    for (name, functions) in [
        ("avg", vec![AggregateFunction::AvgOverTime]),
        ("all", AggregateFunction::ALL.to_vec()),
    ] {
        let state = build_state(&rt, functions);
        let clock = AtomicI64::new(1);
        group.throughput(Throughput::Elements(MACHINES));
        group.bench_with_input(BenchmarkId::from_parameter(name), &state, |b, state| {
            b.to_async(&rt).iter(|| {
                let t = clock.fetch_add(1000, Ordering::Relaxed);
                let batch = create_batch(t, MACHINES);
                async move {
                    let outcome = state.router.ingest(batch).await.expect("ingest");
                    black_box(outcome)
                }
            });
        });
    }
    group.finish();
}

fn bench_batch_parse(c: &mut Criterion) {
    let body = serde_json::to_vec(&create_batch(1_700_000_000_000, MACHINES)).expect("encode");
    let mut group = c.benchmark_group("batch_parse");
    group.throughput(Throughput::Bytes(body.len() as u64));
    group.bench_function("from_slice", |b| {
        b.iter(|| IngestBatch::from_slice(black_box(&body)).expect("parse"))
    });
    group.finish();
}

criterion_group!(benches, bench_routed_ingest, bench_batch_parse);
criterion_main!(benches);
