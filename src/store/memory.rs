use super::IngestStore;
use crate::telemetry::{BindingId, MeasurementRow, SensorId};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct SensorStatus {
    pub(crate) online: bool,
    pub(crate) last_seen: Option<DateTime<Utc>>,
}

/// Pauses `insert_measurements` after it has observed its rows.
#[derive(Default)]
pub(crate) struct InsertGate {
    pub(crate) entered: Notify,
    pub(crate) release: Notify,
}

#[derive(Default)]
struct Tables {
    sensors: HashMap<String, SensorId>,
    bindings: HashMap<SensorId, BindingId>,
    measurements: Vec<MeasurementRow>,
    status: HashMap<SensorId, SensorStatus>,
    statements: Vec<usize>,
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    tables: Mutex<Tables>,
    sensor_lookups: AtomicUsize,
    fail_inserts: AtomicBool,
    fail_status_updates: AtomicBool,
    gate: Mutex<Option<Arc<InsertGate>>>,
}

impl MemoryStore {
    pub(crate) fn add_sensor(&self, name: &str, id: SensorId) {
        let mut tables = self.tables.lock().unwrap();
        tables.sensors.insert(name.to_string(), id);
        tables.status.entry(id).or_default();
    }

    pub(crate) fn bind(&self, sensor_id: SensorId, binding_id: BindingId) {
        self.tables
            .lock()
            .unwrap()
            .bindings
            .insert(sensor_id, binding_id);
    }

    pub(crate) fn unbind(&self, sensor_id: SensorId) {
        self.tables.lock().unwrap().bindings.remove(&sensor_id);
    }

    pub(crate) fn inserted(&self) -> Vec<MeasurementRow> {
        self.tables.lock().unwrap().measurements.clone()
    }

    /// Row count of every insert statement issued so far.
    pub(crate) fn statements(&self) -> Vec<usize> {
        self.tables.lock().unwrap().statements.clone()
    }

    pub(crate) fn status(&self, sensor_id: SensorId) -> SensorStatus {
        self.tables
            .lock()
            .unwrap()
            .status
            .get(&sensor_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn sensor_lookups(&self) -> usize {
        self.sensor_lookups.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_status_updates(&self, fail: bool) {
        self.fail_status_updates.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn gate_inserts(&self) -> Arc<InsertGate> {
        let gate = Arc::new(InsertGate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn lookup_sensor_id(&self, device_name: &str) -> Result<Option<SensorId>> {
        self.sensor_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.tables.lock().unwrap().sensors.get(device_name).copied())
    }

    async fn load_active_bindings(&self) -> Result<HashMap<SensorId, BindingId>> {
        Ok(self.tables.lock().unwrap().bindings.clone())
    }

    async fn insert_measurements(&self, rows: &[MeasurementRow], chunk_size: usize) -> Result<u64> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            bail!("simulated insert failure");
        }
        let mut tables = self.tables.lock().unwrap();
        for chunk in rows.chunks(chunk_size.max(1)) {
            tables.statements.push(chunk.len());
        }
        tables.measurements.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn mark_sensor_online(&self, sensor_id: SensorId, seen_at: DateTime<Utc>) -> Result<()> {
        if self.fail_status_updates.load(Ordering::SeqCst) {
            bail!("simulated status update failure");
        }
        let mut tables = self.tables.lock().unwrap();
        let status = tables.status.entry(sensor_id).or_default();
        status.online = true;
        status.last_seen = Some(seen_at);
        Ok(())
    }

    async fn mark_stale_sensors_offline(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let mut flipped = 0;
        for status in tables.status.values_mut() {
            let stale = status.last_seen.map(|seen| seen < cutoff).unwrap_or(true);
            if status.online && stale {
                status.online = false;
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}
