use super::TelemetryIngestor;
use crate::dead_letter::DeadLetter;
use crate::error::DeadLetterReason;
use crate::telemetry::MeasurementRow;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::time::Instant;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub rows: usize,
    pub written: u64,
    pub dead_lettered: usize,
}

impl TelemetryIngestor {
    /// Appends in arrival order and returns the new buffer length.
    pub(in crate::ingest) async fn append(&self, rows: Vec<MeasurementRow>) -> usize {
        let mut state = self.state.lock().await;
        state.buffer.extend(rows);
        state.buffer.len()
    }

    pub async fn buffered_len(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    /// Writes everything buffered so far. The buffer is swapped out before any I/O starts,
    /// so rows appended while the write is in flight stay for the next flush.
    /// On failure the whole batch is rolled back and each row is dead-lettered.
    pub async fn flush(&self) -> FlushReport {
        let items = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.buffer)
        };
        if items.is_empty() {
            return FlushReport::default();
        }

        let len = items.len();
        let started = Instant::now();
        self.stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);
        let result = self
            .store
            .insert_measurements(&items, self.limits.insert_chunk_size)
            .await;
        self.stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(written) => {
                let micros = started.elapsed().as_micros() as u64;
                self.stats.record_flush(len, micros);
                self.stats.rows_written.fetch_add(written, Ordering::Relaxed);
                self.stats.clear_error();
                tracing::debug!(len, written, micros, "flushed measurement batch");
                FlushReport {
                    rows: len,
                    written,
                    dead_lettered: 0,
                }
            }
            Err(err) => {
                self.stats.record_error(err.to_string());
                tracing::error!(error = %err, len, "failed to flush measurements; dead-lettering batch");
                let failed_at = Utc::now();
                for row in &items {
                    self.dead_letters.record(DeadLetter::new(
                        DeadLetterReason::PersistenceFailure,
                        row.sensor.as_ref(),
                        row.dead_letter_payload(),
                        failed_at,
                    ));
                }
                FlushReport {
                    rows: len,
                    written: 0,
                    dead_lettered: len,
                }
            }
        }
    }
}
