use crate::error::DeadLetterReason;
use crate::pipeline::IngestStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub received_at: DateTime<Utc>,
    /// Topic for transport-level failures, sensor name afterwards.
    pub origin: String,
    pub payload: String,
    pub reason: DeadLetterReason,
}

impl DeadLetter {
    pub fn new(
        reason: DeadLetterReason,
        origin: impl Into<String>,
        payload: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            received_at,
            origin: origin.into(),
            payload: payload.into(),
            reason,
        }
    }

    pub fn from_raw(
        reason: DeadLetterReason,
        origin: impl Into<String>,
        raw: &[u8],
        received_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            reason,
            origin,
            String::from_utf8_lossy(raw).into_owned(),
            received_at,
        )
    }

    /// `<unix_time> <topic_or_sensor> <payload>\n`. The origin never contains a space, so
    /// splitting on the first two spaces recovers all three fields.
    pub fn to_line(&self) -> String {
        let secs = self.received_at.timestamp();
        let micros = self.received_at.timestamp_subsec_micros();
        let origin = escape_line_breaks(&self.origin)
            .replace(' ', "\\x20")
            .replace('\t', "\\t");
        let payload = escape_line_breaks(&self.payload);
        format!("{secs}.{micros:06} {origin} {payload}\n")
    }
}

fn escape_line_breaks(value: &str) -> String {
    value.replace('\r', "\\r").replace('\n', "\\n")
}

/// Producer side of the dead-letter log. `record` never waits on disk I/O.
#[derive(Clone)]
pub struct DeadLetterSink {
    tx: mpsc::UnboundedSender<DeadLetter>,
    stats: Arc<IngestStats>,
}

pub fn channel(stats: Arc<IngestStats>) -> (DeadLetterSink, mpsc::UnboundedReceiver<DeadLetter>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeadLetterSink { tx, stats }, rx)
}

impl DeadLetterSink {
    pub fn record(&self, letter: DeadLetter) {
        self.stats.dead_letters.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            reason = %letter.reason,
            origin = %letter.origin,
            "dead-lettered message"
        );
        if let Err(err) = self.tx.send(letter) {
            tracing::error!(origin = %err.0.origin, "dead-letter writer is gone; record lost");
        }
    }
}

pub async fn run_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<DeadLetter>) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("open dead-letter log {}", path.display()))?;
    tracing::info!(path = %path.display(), "dead-letter log opened");

    while let Some(letter) = rx.recv().await {
        let line = letter.to_line();
        if let Err(err) = file.write_all(line.as_bytes()).await {
            tracing::error!(error = %err, origin = %letter.origin, "failed to append dead letter");
            continue;
        }
        if let Err(err) = file.flush().await {
            tracing::error!(error = %err, "failed to flush dead-letter log");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn letter(payload: &str) -> DeadLetter {
        DeadLetter::new(
            DeadLetterReason::UnknownSensor,
            "acc_1",
            payload,
            Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap(),
        )
    }

    #[test]
    fn line_has_time_origin_payload() {
        assert_eq!(
            letter(r#"{"a":1}"#).to_line(),
            "1700000000.123456 acc_1 {\"a\":1}\n"
        );
    }

    #[test]
    fn line_escapes_embedded_newlines() {
        let line = letter("first\nsecond\r\n").to_line();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with("first\\nsecond\\r\\n\n"));
    }

    #[test]
    fn line_escapes_whitespace_in_origin() {
        let letter = DeadLetter::new(
            DeadLetterReason::MalformedPayload,
            "sensors/acc 1\t\n/data",
            "garbage here",
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        );
        let line = letter.to_line();
        let fields: Vec<&str> = line.trim_end_matches('\n').splitn(3, ' ').collect();
        assert_eq!(fields[0], "1700000000.000000");
        assert_eq!(fields[1], "sensors/acc\\x201\\t\\n/data");
        assert_eq!(fields[2], "garbage here");
    }

    #[test]
    fn from_raw_is_lossy_utf8() {
        let letter = DeadLetter::from_raw(
            DeadLetterReason::MalformedPayload,
            "sensors/acc_1/data",
            &[0x7b, 0xff, 0x7d],
            Utc::now(),
        );
        assert_eq!(letter.payload, "{\u{fffd}}");
    }

    #[test]
    fn record_counts_and_forwards() {
        let stats = Arc::new(IngestStats::new());
        let (sink, mut rx) = channel(stats.clone());
        sink.record(letter("x"));
        sink.record(letter("y"));
        assert_eq!(stats.dead_letters.load(Ordering::Relaxed), 2);
        assert_eq!(rx.try_recv().unwrap().payload, "x");
        assert_eq!(rx.try_recv().unwrap().payload, "y");
    }

    #[test]
    fn record_survives_closed_writer() {
        let stats = Arc::new(IngestStats::new());
        let (sink, rx) = channel(stats.clone());
        drop(rx);
        sink.record(letter("x"));
        assert_eq!(stats.dead_letters.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn writer_appends_lines_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_letters.log");
        std::fs::write(&path, "existing\n").unwrap();

        let stats = Arc::new(IngestStats::new());
        let (sink, rx) = channel(stats);
        sink.record(letter("one"));
        sink.record(letter("two"));
        drop(sink);

        run_writer(path.clone(), rx).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "existing");
        assert_eq!(lines[1], "1700000000.123456 acc_1 one");
        assert_eq!(lines[2], "1700000000.123456 acc_1 two");
    }
}
