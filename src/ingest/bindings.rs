use super::TelemetryIngestor;
use crate::telemetry::{BindingId, SensorId};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Difference between two consecutive binding snapshots, each list sorted by sensor id.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BindingDiff {
    pub added: Vec<(SensorId, BindingId)>,
    pub removed: Vec<(SensorId, BindingId)>,
    /// Sensor stayed bound but moved to another binding: `(sensor, old, new)`.
    pub rebound: Vec<(SensorId, BindingId, BindingId)>,
}

impl BindingDiff {
    pub fn between(
        previous: &HashMap<SensorId, BindingId>,
        next: &HashMap<SensorId, BindingId>,
    ) -> Option<Self> {
        if previous == next {
            return None;
        }
        let mut diff = Self::default();
        for (sensor_id, binding_id) in next {
            match previous.get(sensor_id) {
                None => diff.added.push((*sensor_id, *binding_id)),
                Some(old) if old != binding_id => {
                    diff.rebound.push((*sensor_id, *old, *binding_id))
                }
                Some(_) => {}
            }
        }
        for (sensor_id, binding_id) in previous {
            if !next.contains_key(sensor_id) {
                diff.removed.push((*sensor_id, *binding_id));
            }
        }
        diff.added.sort_unstable();
        diff.removed.sort_unstable();
        diff.rebound.sort_unstable();
        Some(diff)
    }
}

impl TelemetryIngestor {
    pub(in crate::ingest) async fn binding_for(&self, sensor_id: SensorId) -> Option<BindingId> {
        let state = self.state.lock().await;
        state.bindings.get(&sensor_id).copied()
    }

    pub async fn active_bindings(&self) -> Arc<HashMap<SensorId, BindingId>> {
        self.state.lock().await.bindings.clone()
    }

    /// Reloads the active set and swaps it in as one assignment. Logs only when it changed.
    pub async fn refresh_bindings(&self) -> Result<Option<BindingDiff>> {
        let next = self.store.load_active_bindings().await?;

        let diff = {
            let mut state = self.state.lock().await;
            let diff = BindingDiff::between(&state.bindings, &next);
            state.bindings = Arc::new(next);
            diff
        };

        if let Some(diff) = &diff {
            tracing::info!(
                added = ?diff.added,
                removed = ?diff.removed,
                rebound = ?diff.rebound,
                "active bindings updated"
            );
        }
        Ok(diff)
    }
}

pub fn spawn_binding_refresher(ingestor: TelemetryIngestor, refresh_interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = ingestor.refresh_bindings().await {
                tracing::warn!(error = %err, "binding refresh failed; keeping previous bindings");
            }
        }
    })
}
