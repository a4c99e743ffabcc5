//! End-to-end tests against real partition listeners

use promsketch::api::{self, ApiState, SpawnMode};
use promsketch::cluster::RegisterRequest;
use promsketch::config::ServerConfig;
use promsketch::ingester::NodeStatus;
use promsketch::journal::Journals;
use promsketch::sketch::AggregateFunction;
use promsketch::Error;

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A port that was free a moment ago.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn config(base_port: u16) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.routing.base_port = base_port;
    config.routing.machines_per_partition = 10;
    config.routing.max_partitions = 1;
    config.functions = vec![AggregateFunction::AvgOverTime];
    config
}

fn register(estimated_timeseries: u64) -> RegisterRequest {
    RegisterRequest {
        estimated_timeseries,
        machines_per_port: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partition_listener_serves_ingest_and_debug() {
    let port = free_port().await;
    let shutdown = CancellationToken::new();
    let state = ApiState::build(
        &config(port),
        Arc::new(Journals::disabled()),
        SpawnMode::Listeners(shutdown.clone()),
    )
    .unwrap();

    let plan = state.control.register_config(register(10)).await.unwrap();
    assert_eq!(plan.ports_active, vec![port]);

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", port);

    for t in [1000, 2000, 3000] {
        let response = client
            .post(format!("{}/ingest", base))
            .json(&json!({
                "Timestamp": t,
                "Metrics": [
                    {"Name": "cpu", "Labels": {"machineid": "machine_2"}, "Value": 1.5},
                    {"Name": "cpu", "Labels": {"machineid": "machine_42"}, "Value": 1.5},
                ]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["ingested_metrics_count"], 1);
        // machine_42 belongs to no partition served here
        assert_eq!(body["failed_metrics_count"], 1);
    }

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["partition"], 0);
    assert_eq!(health["port"], port);

    let section: Value = client
        .get(format!("{}/debug-state", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(section["sketch_count"], 1);
    assert_eq!(section["ingested_samples"], 3);
    assert_eq!(section["degraded"], false);

    // the control address sees the same sketches
    let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_addr: SocketAddr = control.local_addr().unwrap();
    let app = api::control_router(state.clone());
    let control_shutdown = shutdown.clone();
    let control_task = tokio::spawn(async move {
        axum::serve(control, app)
            .with_graceful_shutdown(async move { control_shutdown.cancelled().await })
            .await
    });

    let response = client
        .get(format!(
            "http://{}/query?func=avg_over_time&metric=cpu&mint=1000&maxt=3000&label_machineid=machine_2",
            control_addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"][0]["value"], 1.5);

    shutdown.cancel();
    state.shutdown().await;
    control_task.await.unwrap().unwrap();
    assert_eq!(state.table().snapshot().nodes[0].status(), NodeStatus::Stopped);
}

#[tokio::test]
async fn test_bind_failure_is_a_provisioning_error() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    let state = ApiState::build(
        &config(port),
        Arc::new(Journals::disabled()),
        SpawnMode::Listeners(shutdown.clone()),
    )
    .unwrap();

    let err = state.control.register_config(register(10)).await.unwrap_err();
    assert!(matches!(err, Error::Provisioning(_)));
    assert!(state.table().is_empty());
    assert_eq!(state.control.debug_state().status, "ok");

    shutdown.cancel();
    state.shutdown().await;
    drop(occupied);
}
