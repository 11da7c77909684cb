mod bindings;
mod buffer;
pub mod liveness;
mod sensors;
mod state;


use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::error::DeadLetterReason;
use crate::pipeline::IngestStats;
use crate::store::IngestStore;
use crate::telemetry::DataBatch;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

pub use bindings::spawn_binding_refresher;
pub use buffer::FlushReport;

#[derive(Clone, Copy, Debug)]
pub struct IngestLimits {
    pub max_buffer_size: usize,
    pub insert_chunk_size: usize,
}

/// A decoded data message waiting for sensor and binding resolution.
#[derive(Debug)]
pub struct DataMessage {
    pub sensor: String,
    pub topic: String,
    pub batch: DataBatch,
    pub raw: Bytes,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Buffered { rows: usize, flushed: bool },
    DeadLettered(DeadLetterReason),
}

/// Shared worker state. Clones are cheap and every clone sees the same cache, bindings and buffer.
#[derive(Clone)]
pub struct TelemetryIngestor {
    store: Arc<dyn IngestStore>,
    state: Arc<Mutex<state::IngestState>>,
    dead_letters: DeadLetterSink,
    stats: Arc<IngestStats>,
    limits: IngestLimits,
    offline_threshold: ChronoDuration,
}

impl TelemetryIngestor {
    pub fn new(
        store: Arc<dyn IngestStore>,
        dead_letters: DeadLetterSink,
        stats: Arc<IngestStats>,
        limits: IngestLimits,
        offline_threshold: std::time::Duration,
    ) -> Self {
        let offline_threshold = ChronoDuration::from_std(offline_threshold)
            .unwrap_or_else(|_| ChronoDuration::seconds(30));
        Self {
            store,
            state: Arc::new(Mutex::new(state::IngestState::new())),
            dead_letters,
            stats,
            limits,
            offline_threshold,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Resolves sensor and binding, then buffers the flattened rows.
    /// Every failure ends up in the dead-letter log; nothing is returned as an error.
    pub async fn ingest_message(&self, message: DataMessage) -> IngestOutcome {
        let sensor_id = match self.resolve_sensor(&message.sensor).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                return self.reject(&message, DeadLetterReason::UnknownSensor);
            }
            Err(err) => {
                tracing::warn!(error = %err, sensor = %message.sensor, "sensor lookup failed");
                return self.reject(&message, DeadLetterReason::PersistenceFailure);
            }
        };

        let Some(binding_id) = self.binding_for(sensor_id).await else {
            tracing::debug!(
                sensor = %message.sensor,
                topic = %message.topic,
                sensor_id,
                "no active binding for sensor"
            );
            return self.reject(&message, DeadLetterReason::InactiveBinding);
        };

        let sensor: Arc<str> = Arc::from(message.sensor.as_str());
        let rows = message.batch.flatten(&sensor, binding_id);
        let count = rows.len();
        let buffered = self.append(rows).await;
        tracing::trace!(sensor = %sensor, binding_id, rows = count, buffered, "buffered samples");

        let mut flushed = false;
        if buffered >= self.limits.max_buffer_size {
            tracing::debug!(buffered, max = self.limits.max_buffer_size, "buffer full; flushing");
            self.flush().await;
            flushed = true;
        }
        IngestOutcome::Buffered {
            rows: count,
            flushed,
        }
    }

    fn reject(&self, message: &DataMessage, reason: DeadLetterReason) -> IngestOutcome {
        self.dead_letters.record(DeadLetter::from_raw(
            reason,
            message.sensor.as_str(),
            &message.raw,
            message.received_at,
        ));
        IngestOutcome::DeadLettered(reason)
    }

    /// Names of sensors currently claimed by a running test, falling back to the numeric id
    /// for sensors that have not been seen by this worker yet.
    pub async fn active_sensor_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .bindings
            .keys()
            .map(|sensor_id| {
                state
                    .sensor_ids
                    .iter()
                    .find(|(_, id)| *id == sensor_id)
                    .map(|(name, _)| name.clone())
                    .unwrap_or_else(|| sensor_id.to_string())
            })
            .collect();
        names.sort();
        names
    }
}
