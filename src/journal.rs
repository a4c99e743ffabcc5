//! Append-only CSV journals
//!
//! Three journals are written for external tooling: ingest throughput,
//! aggregation events and window-coverage events. Files are opened in append
//! mode and get a header row only when created empty.
//!
//! Rows are queued to a writer thread per journal. Recording never waits on
//! the disk: when the queue is full the row is dropped and counted. A write
//! failure is logged and never fails the request that produced the row.

use crate::metrics::ServerMetrics;
use crate::Result;

use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const THROUGHPUT_FILE: &str = "throughput.csv";
pub const AGGREGATION_FILE: &str = "aggregation_debug.csv";
pub const COVERAGE_FILE: &str = "coverage_debug.csv";

/// Rows a journal buffers ahead of its writer
pub const DEFAULT_QUEUE: usize = 4096;

enum Message<R> {
    Row(R),
    Flush(oneshot::Sender<()>),
}

/// One append-only CSV file fed by a writer thread
pub struct CsvJournal<R> {
    path: PathBuf,
    tx: mpsc::Sender<Message<R>>,
    dropped: AtomicU64,
}

impl<R: Serialize + Send + 'static> CsvJournal<R> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let write_header = file.metadata().await?.len() == 0;
        let file = file.into_std().await;
        Self::from_writer(path, file, write_header, DEFAULT_QUEUE)
    }

    /// Journal over any sink. `path` only labels log lines.
    pub fn from_writer<W: Write + Send + 'static>(
        path: PathBuf,
        sink: W,
        write_header: bool,
        queue: usize,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(sink);
        let label = path.clone();
        std::thread::Builder::new()
            .name("journal-writer".to_string())
            .spawn(move || drain(label, writer, rx))?;
        Ok(Self {
            path,
            tx,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows discarded because the writer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue `row` for writing without waiting.
    pub fn append(&self, row: R) {
        match self.tx.try_send(Message::Row(row)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(path = %self.path.display(), dropped, "Journal queue full, row dropped");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(path = %self.path.display(), "Journal writer stopped, row dropped");
            }
        }
    }

    /// Resolves once every row queued before the call has been written.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Message::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

fn drain<R: Serialize, W: Write>(
    path: PathBuf,
    mut writer: csv::Writer<W>,
    mut rx: mpsc::Receiver<Message<R>>,
) {
    while let Some(message) = rx.blocking_recv() {
        match message {
            Message::Row(row) => {
                let written = writer
                    .serialize(&row)
                    .and_then(|_| writer.flush().map_err(csv::Error::from));
                if let Err(e) = written {
                    warn!(path = %path.display(), error = %e, "Journal append failed");
                }
            }
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!(path = %path.display(), "Journal writer stopped");
}

/// Row of the throughput journal
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThroughputRow {
    pub timestamp_ms: i64,
    pub samples_per_sec: f64,
    pub total_ingested: u64,
}

/// One evaluated query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationEvent {
    pub timestamp_ms: i64,
    pub function: String,
    pub series: String,
    pub mint: i64,
    pub maxt: i64,
    pub arg: Option<f64>,
    pub samples: usize,
    pub first_value: Option<f64>,
    pub latency_us: u64,
}

/// One coverage decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageEvent {
    pub timestamp_ms: i64,
    pub function: String,
    pub series: String,
    pub mint: i64,
    pub maxt: i64,
    pub min_observed: Option<i64>,
    pub max_observed: Option<i64>,
    pub state: String,
}

/// The set of journals. Any journal may be absent.
#[derive(Default)]
pub struct Journals {
    throughput: Option<CsvJournal<ThroughputRow>>,
    aggregation: Option<CsvJournal<AggregationEvent>>,
    coverage: Option<CsvJournal<CoverageEvent>>,
}

impl Journals {
    /// No journals; every record call is a no-op.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open all three journals under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let journals = Self {
            throughput: Some(CsvJournal::open(dir.join(THROUGHPUT_FILE)).await?),
            aggregation: Some(CsvJournal::open(dir.join(AGGREGATION_FILE)).await?),
            coverage: Some(CsvJournal::open(dir.join(COVERAGE_FILE)).await?),
        };
        info!(dir = %dir.display(), "Opened journals");
        Ok(journals)
    }

    pub fn is_enabled(&self) -> bool {
        self.throughput.is_some() || self.aggregation.is_some() || self.coverage.is_some()
    }

    pub fn record_throughput(&self, row: ThroughputRow) {
        if let Some(journal) = &self.throughput {
            journal.append(row);
        }
    }

    pub fn record_aggregation(&self, event: AggregationEvent) {
        if let Some(journal) = &self.aggregation {
            journal.append(event);
        }
    }

    pub fn record_coverage(&self, event: CoverageEvent) {
        if let Some(journal) = &self.coverage {
            journal.append(event);
        }
    }

    /// Wait for every queued row to reach disk.
    pub async fn flush(&self) {
        if let Some(journal) = &self.throughput {
            journal.flush().await;
        }
        if let Some(journal) = &self.aggregation {
            journal.flush().await;
        }
        if let Some(journal) = &self.coverage {
            journal.flush().await;
        }
    }
}

/// Periodically log and journal the ingest rate until `shutdown` fires.
pub fn spawn_throughput_reporter(
    journals: Arc<Journals>,
    metrics: Arc<ServerMetrics>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // first tick completes immediately
        ticker.tick().await;
        let mut last_total = metrics.total_ingested.get();
        let mut last_at = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Throughput reporter stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let total = metrics.total_ingested.get();
                    let elapsed = last_at.elapsed().as_secs_f64();
                    let rate = if elapsed > 0.0 {
                        total.saturating_sub(last_total) as f64 / elapsed
                    } else {
                        0.0
                    };
                    info!(samples_per_sec = rate, total_ingested = total, "Ingest throughput");
                    journals.record_throughput(ThroughputRow {
                        timestamp_ms: Utc::now().timestamp_millis(),
                        samples_per_sec: rate,
                        total_ingested: total,
                    });
                    last_total = total;
                    last_at = Instant::now();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Serialize)]
    struct Pair {
        a: i64,
        b: String,
    }

    fn pair(a: i64, b: &str) -> Pair {
        Pair { a, b: b.to_string() }
    }

    /// Blocks its first write until released.
    struct GatedSink {
        release: std::sync::mpsc::Receiver<()>,
        released: bool,
        out: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for GatedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.released {
                let _ = self.release.recv();
                self.released = true;
            }
            self.out.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.csv");
        {
            let journal = CsvJournal::open(&path).await.unwrap();
            journal.append(pair(1, "2"));
            journal.flush().await;
        }
        {
            let journal = CsvJournal::open(&path).await.unwrap();
            journal.append(pair(3, "x,y"));
            journal.flush().await;
        }
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "a,b\n1,2\n3,\"x,y\"\n");
    }

    #[tokio::test]
    async fn test_append_never_waits_on_stalled_writer() {
        let (release, gate) = std::sync::mpsc::channel();
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = GatedSink {
            release: gate,
            released: false,
            out: out.clone(),
        };
        let journal = CsvJournal::from_writer("stalled.csv".into(), sink, true, 2).unwrap();

        let started = Instant::now();
        for i in 0..50 {
            journal.append(pair(i, "x"));
        }
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(journal.dropped() > 0);

        release.send(()).unwrap();
        journal.flush().await;
        let text = String::from_utf8(out.lock().clone()).unwrap();
        assert!(text.starts_with("a,b\n0,x\n"));
        assert_eq!(text.lines().count() as u64, 1 + 50 - journal.dropped());
    }

    #[tokio::test]
    async fn test_journals_open_creates_files() {
        let dir = TempDir::new().unwrap();
        let journals = Journals::open(dir.path().join("nested")).await.unwrap();
        assert!(journals.is_enabled());
        journals.record_coverage(CoverageEvent {
            timestamp_ms: 7,
            function: "avg_over_time".into(),
            series: r#"{__name__="m"}"#.into(),
            mint: 1,
            maxt: 2,
            min_observed: None,
            max_observed: None,
            state: "uncovered".into(),
        });
        journals.flush().await;
        let content = tokio::fs::read_to_string(dir.path().join("nested").join(COVERAGE_FILE))
            .await
            .unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("timestamp_ms,function,series"));
        assert_eq!(
            lines[1],
            r#"7,avg_over_time,"{__name__=""m""}",1,2,,,uncovered"#
        );
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let journals = Journals::disabled();
        assert!(!journals.is_enabled());
        journals.record_throughput(ThroughputRow {
            timestamp_ms: 1,
            samples_per_sec: 0.0,
            total_ingested: 0,
        });
        journals.flush().await;
    }

    #[tokio::test]
    async fn test_reporter_writes_rows_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let journals = Arc::new(Journals::open(dir.path()).await.unwrap());
        let metrics = Arc::new(ServerMetrics::new().unwrap());
        metrics.total_ingested.inc_by(10);
        let shutdown = CancellationToken::new();
        let handle = spawn_throughput_reporter(
            journals.clone(),
            metrics,
            Duration::from_millis(10),
            shutdown.clone(),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        handle.await.unwrap();
        journals.flush().await;

        let content = tokio::fs::read_to_string(dir.path().join(THROUGHPUT_FILE))
            .await
            .unwrap();
        let rows: Vec<_> = content.lines().skip(1).collect();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r.ends_with(",10")));
    }
}
