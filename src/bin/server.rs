//! promsketch server
//!
//! Serves the control address and, when enabled, one listener per partition.

use promsketch::api::{self, ApiState, SpawnMode};
use promsketch::cluster::RegisterRequest;
use promsketch::config::ServerConfig;
use promsketch::journal::{self, Journals};
use promsketch::sketch::AggregateFunction;
use promsketch::telemetry::Telemetry;
use promsketch::Error;

use clap::Parser;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// promsketch server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host every address binds on
    #[arg(long, env = "PROMSKETCH_BIND_HOST", default_value = "127.0.0.1")]
    bind_host: IpAddr,

    /// Control address port
    #[arg(long, env = "PROMSKETCH_CONTROL_PORT", default_value = "7000")]
    control_port: u16,

    /// Port of partition 0
    #[arg(long, env = "PROMSKETCH_BASE_PORT", default_value = "7100")]
    base_port: u16,

    /// Machines owned by each partition
    #[arg(long, env = "PROMSKETCH_MACHINES_PER_PORT", default_value = "200")]
    machines_per_port: u64,

    /// Extra ports that must never host a partition (comma separated)
    #[arg(long, env = "PROMSKETCH_PORT_BLOCKLIST", value_delimiter = ',')]
    port_blocklist: Vec<u16>,

    /// Upper bound on the number of partitions
    #[arg(long, env = "PROMSKETCH_MAX_PARTITIONS", default_value = "64")]
    max_partitions: usize,

    /// Process-wide ceiling on concurrent sub-batch inserts
    #[arg(long, env = "PROMSKETCH_INGEST_CONCURRENCY", default_value = "64")]
    ingest_concurrency: usize,

    /// Per sub-batch send timeout in milliseconds
    #[arg(long, env = "PROMSKETCH_SEND_TIMEOUT_MS", default_value = "8000")]
    send_timeout_ms: u64,

    /// How long a query may wait for a busy sketch, in milliseconds
    #[arg(long, env = "PROMSKETCH_COVERAGE_TIMEOUT_MS", default_value = "250")]
    coverage_timeout_ms: u64,

    /// Functions of interest (comma separated); all when unset
    #[arg(long, env = "PROMSKETCH_FUNCTIONS")]
    functions: Option<String>,

    /// Sketch time window in milliseconds
    #[arg(long, env = "PROMSKETCH_TIME_WINDOW_MS", default_value = "60000")]
    time_window_ms: i64,

    /// Sketch item window
    #[arg(long, env = "PROMSKETCH_ITEM_WINDOW", default_value = "100000")]
    item_window: usize,

    /// Expected number of distinct sample values
    #[arg(long, env = "PROMSKETCH_VALUE_SCALE", default_value = "10000")]
    value_scale: u64,

    /// Sketch time bucket width in milliseconds
    #[arg(long, env = "PROMSKETCH_BUCKET_MS", default_value = "1000")]
    bucket_ms: i64,

    /// Directory for CSV journals; disabled when unset
    #[arg(long, env = "PROMSKETCH_JOURNAL_DIR")]
    journal_dir: Option<PathBuf>,

    /// Throughput report interval in seconds
    #[arg(long, env = "PROMSKETCH_THROUGHPUT_INTERVAL_SECS", default_value = "5")]
    throughput_interval_secs: u64,

    /// Metric whose sketches are created eagerly on new partitions
    #[arg(long, env = "PROMSKETCH_PREWARM_METRIC")]
    prewarm_metric: Option<String>,

    /// Capacity to register at startup
    #[arg(long, env = "NUM_TIMESERIES_INIT")]
    initial_timeseries: Option<u64>,

    /// Serve everything from the control address only
    #[arg(long, env = "PROMSKETCH_NO_PARTITION_LISTENERS")]
    no_partition_listeners: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Error> {
        let mut config = ServerConfig::default();

        config.routing.bind_host = self.bind_host;
        config.routing.control_port = self.control_port;
        config.routing.base_port = self.base_port;
        config.routing.machines_per_partition = self.machines_per_port;
        config.routing.max_partitions = self.max_partitions;
        config.routing.reserved_ports = self
            .port_blocklist
            .into_iter()
            .chain(std::iter::once(self.control_port))
            .collect::<BTreeSet<_>>();

        config.sketch.time_window_ms = self.time_window_ms;
        config.sketch.item_window = self.item_window;
        config.sketch.value_scale = self.value_scale;
        config.sketch.bucket_ms = self.bucket_ms;
        if let Some(raw) = self.functions.as_deref() {
            config.functions = AggregateFunction::parse_list(raw)?;
        }

        config.ingest.max_concurrent_inserts = self.ingest_concurrency;
        config.ingest.send_timeout = Duration::from_millis(self.send_timeout_ms);
        config.query.coverage_timeout = Duration::from_millis(self.coverage_timeout_ms);

        config.journal_dir = self.journal_dir;
        config.throughput_interval = Duration::from_secs(self.throughput_interval_secs);
        config.prewarm_metric = self.prewarm_metric.filter(|m| !m.trim().is_empty());
        config.initial_timeseries = self.initial_timeseries;
        config.partition_listeners = !self.no_partition_listeners;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _telemetry = Telemetry::init_for_component("promsketch-server", &args.log_level)?;

    info!("Starting promsketch server");

    let config = args.into_config()?;
    config.validate()?;

    let journals = Arc::new(match &config.journal_dir {
        Some(dir) => Journals::open(dir).await?,
        None => Journals::disabled(),
    });

    let shutdown = CancellationToken::new();
    let mode = if config.partition_listeners {
        SpawnMode::Listeners(shutdown.clone())
    } else {
        SpawnMode::InProcess
    };
    let state = ApiState::build(&config, journals.clone(), mode)?;

    if let Some(estimated_timeseries) = config.initial_timeseries {
        match state
            .control
            .register_config(RegisterRequest {
                estimated_timeseries,
                machines_per_port: None,
            })
            .await
        {
            Ok(plan) => info!(
                ports = ?plan.ports_active,
                partitions_added = plan.partitions_added,
                "Initial registration complete"
            ),
            Err(e) => warn!(error = %e, "Initial registration failed"),
        }
    }

    let reporter = journal::spawn_throughput_reporter(
        journals.clone(),
        state.metrics.clone(),
        config.throughput_interval,
        shutdown.clone(),
    );

    let addr = SocketAddr::new(config.routing.bind_host, config.routing.control_port);
    let listener = TcpListener::bind(addr).await?;
    info!(
        %addr,
        base_port = config.routing.base_port,
        machines_per_partition = config.routing.machines_per_partition,
        functions = config.functions.len(),
        "Control address ready"
    );

    let app = api::control_router(state.clone());
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        server_shutdown.cancel();
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await;

    // the control server may also stop on its own; make sure everything else follows
    shutdown.cancel();
    state.shutdown().await;
    if let Err(e) = reporter.await {
        error!(error = %e, "Throughput reporter panicked");
    }
    journals.flush().await;

    info!("promsketch server shutting down");
    served.map_err(|e| Error::Internal(format!("HTTP server error: {e}")))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
