use crate::telemetry::{BindingId, MeasurementRow, SensorId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
pub(in crate::ingest) struct IngestState {
    /// `device_name -> id`; entries are never evicted.
    pub(in crate::ingest) sensor_ids: HashMap<String, SensorId>,
    /// Replaced wholesale on every refresh, never edited in place.
    pub(in crate::ingest) bindings: Arc<HashMap<SensorId, BindingId>>,
    pub(in crate::ingest) buffer: Vec<MeasurementRow>,
}

impl IngestState {
    pub(in crate::ingest) fn new() -> Self {
        Self {
            sensor_ids: HashMap::new(),
            bindings: Arc::new(HashMap::new()),
            buffer: Vec::new(),
        }
    }
}
