use crate::ingest::{DataMessage, TelemetryIngestor};
use anyhow::Result;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug)]
pub enum IngestCommand {
    Data(DataMessage),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<IngestCommand>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<IngestCommand>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Waits for queue capacity; this is where transport backpressure comes from.
    pub async fn enqueue(&self, message: DataMessage) -> Result<()> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, sensor = %message.sensor, "queued data message");
        if let Err(err) = self.tx.send(IngestCommand::Data(message)).await {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow::anyhow!("ingest queue closed: {err}"));
        }
        Ok(())
    }

    /// Flushes after every message queued ahead of this call has been processed.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(IngestCommand::Flush(tx))
            .await
            .map_err(|_| anyhow::anyhow!("ingest queue closed"))?;
        let _ = rx.await;
        Ok(())
    }
}

#[derive(Debug)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub rows_written: AtomicU64,
    pub dead_letters: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            inflight_flushes: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            dead_letters: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub(crate) fn record_flush(&self, len: usize, micros: u64) {
        self.last_batch_len.store(len as u64, Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_millis() as u64;
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
        let prev = self.average_flush_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 {
            micros
        } else {
            (prev + micros) / 2
        };
        self.average_flush_micros.store(avg, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`IngestStats`], used for periodic status logging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub queue_depth: u64,
    pub last_flush_unix_ms: u64,
    pub last_batch_len: u64,
    pub average_flush_micros: u64,
    pub inflight_flushes: u64,
    pub rows_written: u64,
    pub dead_letters: u64,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            last_flush_unix_ms: self.last_flush_unix_ms.load(Ordering::Relaxed),
            last_batch_len: self.last_batch_len.load(Ordering::Relaxed),
            average_flush_micros: self.average_flush_micros.load(Ordering::Relaxed),
            inflight_flushes: self.inflight_flushes.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error(),
        }
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains the data queue. A size-triggered flush completes before the next message is taken.
pub fn spawn_processor(
    ingestor: TelemetryIngestor,
    mut rx: mpsc::Receiver<IngestCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stats = ingestor.stats();
        tracing::info!("message processor started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                IngestCommand::Data(message) => {
                    stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    ingestor.ingest_message(message).await;
                }
                IngestCommand::Flush(done) => {
                    ingestor.flush().await;
                    let _ = done.send(());
                }
            }
        }
        tracing::info!("ingest queue closed; message processor exiting");
    })
}

pub fn spawn_flusher(ingestor: TelemetryIngestor, flush_interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; there is nothing to flush yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = ingestor.flush().await;
            if report.rows > 0 {
                tracing::debug!(
                    rows = report.rows,
                    written = report.written,
                    dead_lettered = report.dead_lettered,
                    "interval flush"
                );
            }
        }
    })
}

/// Debug-level heartbeat of the worker itself: who is being recorded and how the queue looks.
pub fn spawn_status_reporter(ingestor: TelemetryIngestor, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let active = ingestor.active_sensor_names().await;
            tracing::debug!(count = active.len(), sensors = ?active, "active sensors");
            let snapshot = ingestor.stats().snapshot();
            tracing::debug!(
                queue_depth = snapshot.queue_depth,
                last_flush_unix_ms = snapshot.last_flush_unix_ms,
                inflight_flushes = snapshot.inflight_flushes,
                last_batch_len = snapshot.last_batch_len,
                average_flush_micros = snapshot.average_flush_micros,
                rows_written = snapshot.rows_written,
                dead_letters = snapshot.dead_letters,
                mqtt_connected = snapshot.mqtt_connected,
                last_error = ?snapshot.last_error,
                "ingest status"
            );
        }
    })
}
