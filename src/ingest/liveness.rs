//! Lease-style sensor liveness: every heartbeat renews `sensor_last_seen`, and a periodic
//! sweep flips sensors whose lease ran out back to offline in one statement.

use super::TelemetryIngestor;
use crate::dead_letter::DeadLetter;
use crate::error::DeadLetterReason;
use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub sensor: String,
    pub raw: Bytes,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Online,
    DeadLettered(DeadLetterReason),
}

/// Handed to the transport; posting a heartbeat never waits.
#[derive(Clone)]
pub struct LivenessHandle {
    tx: mpsc::UnboundedSender<Heartbeat>,
}

pub fn channel() -> (LivenessHandle, mpsc::UnboundedReceiver<Heartbeat>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LivenessHandle { tx }, rx)
}

impl LivenessHandle {
    pub fn heartbeat(&self, heartbeat: Heartbeat) {
        if let Err(err) = self.tx.send(heartbeat) {
            tracing::warn!(sensor = %err.0.sensor, "liveness tracker stopped; heartbeat dropped");
        }
    }
}

impl TelemetryIngestor {
    pub async fn record_heartbeat(&self, heartbeat: &Heartbeat) -> HeartbeatOutcome {
        let reason = match self.resolve_sensor(&heartbeat.sensor).await {
            Ok(Some(sensor_id)) => {
                match self
                    .store
                    .mark_sensor_online(sensor_id, heartbeat.received_at)
                    .await
                {
                    Ok(()) => {
                        tracing::trace!(sensor = %heartbeat.sensor, sensor_id, "heartbeat");
                        return HeartbeatOutcome::Online;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, sensor = %heartbeat.sensor, "failed to mark sensor online");
                        DeadLetterReason::PersistenceFailure
                    }
                }
            }
            Ok(None) => DeadLetterReason::UnknownSensor,
            Err(err) => {
                tracing::warn!(error = %err, sensor = %heartbeat.sensor, "sensor lookup failed");
                DeadLetterReason::PersistenceFailure
            }
        };

        self.dead_letters.record(DeadLetter::from_raw(
            reason,
            heartbeat.sensor.as_str(),
            &heartbeat.raw,
            heartbeat.received_at,
        ));
        HeartbeatOutcome::DeadLettered(reason)
    }

    /// Marks offline every sensor whose last heartbeat is strictly older than the timeout.
    pub async fn check_offline(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - self.offline_threshold;
        let flipped = self.store.mark_stale_sensors_offline(cutoff).await?;
        if flipped > 0 {
            tracing::info!(flipped, %cutoff, "marked stale sensors offline");
        }
        Ok(flipped)
    }

    pub fn offline_sweep_interval(&self) -> Duration {
        (self.offline_threshold / 2)
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_millis(100))
    }
}

/// Applies heartbeats as they arrive and sweeps stale sensors every `timeout / 2`.
pub fn spawn_liveness_tracker(
    ingestor: TelemetryIngestor,
    mut rx: mpsc::UnboundedReceiver<Heartbeat>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ingestor.offline_sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = ingestor.check_offline(Utc::now()).await {
                        tracing::warn!(error = %err, "offline sweep failed");
                    }
                }
                heartbeat = rx.recv() => {
                    let Some(heartbeat) = heartbeat else {
                        tracing::info!("heartbeat channel closed; liveness tracker exiting");
                        break;
                    };
                    ingestor.record_heartbeat(&heartbeat).await;
                }
            }
        }
    })
}
