use super::TelemetryIngestor;
use crate::telemetry::SensorId;
use anyhow::Result;

impl TelemetryIngestor {
    /// Cache first; on a miss one store lookup. Only hits are cached, so an unknown sensor
    /// is looked up again on its next message.
    pub(in crate::ingest) async fn resolve_sensor(&self, device_name: &str) -> Result<Option<SensorId>> {
        {
            let state = self.state.lock().await;
            if let Some(id) = state.sensor_ids.get(device_name) {
                return Ok(Some(*id));
            }
        }

        let Some(id) = self.store.lookup_sensor_id(device_name).await? else {
            tracing::warn!(sensor = %device_name, "unknown sensor");
            return Ok(None);
        };

        let mut state = self.state.lock().await;
        state.sensor_ids.insert(device_name.to_string(), id);
        tracing::debug!(sensor = %device_name, sensor_id = id, "cached sensor id");
        Ok(Some(id))
    }
}
