use crate::telemetry::{BindingId, MeasurementRow, SensorId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder, Row};
use std::collections::HashMap;
use std::time::Duration;

#[cfg(test)]
pub(crate) mod memory;

/// Everything the worker reads from or writes to the metadata and time-series store.
#[async_trait]
pub trait IngestStore: Send + Sync {
    async fn lookup_sensor_id(&self, device_name: &str) -> Result<Option<SensorId>>;

    /// `sensor_id -> binding_id` for every active binding.
    async fn load_active_bindings(&self) -> Result<HashMap<SensorId, BindingId>>;

    /// Inserts all rows in one transaction, `chunk_size` rows per statement.
    /// Either every row is committed or none is.
    async fn insert_measurements(&self, rows: &[MeasurementRow], chunk_size: usize) -> Result<u64>;

    async fn mark_sensor_online(&self, sensor_id: SensorId, seen_at: DateTime<Utc>) -> Result<()>;

    /// Flips every online sensor last seen before `cutoff` to offline.
    async fn mark_stale_sensors_offline(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

pub async fn build_pool(
    database_url: &str,
    max_connections: u32,
    statement_timeout: Duration,
) -> Result<PgPool> {
    let timeout_ms = statement_timeout.as_millis() as u64;
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(statement_timeout)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = {timeout_ms}"))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
        .context("connect to measurement database")?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IngestStore for PgStore {
    async fn lookup_sensor_id(&self, device_name: &str) -> Result<Option<SensorId>> {
        let row = sqlx::query("SELECT id FROM metadata.sensors WHERE device_name = $1")
            .bind(device_name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<i32, _>("id")?)),
            None => Ok(None),
        }
    }

    async fn load_active_bindings(&self) -> Result<HashMap<SensorId, BindingId>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sensor_id
            FROM metadata.test_relations
            WHERE active = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let binding_id: i32 = row.try_get("id")?;
            let sensor_id: i32 = row.try_get("sensor_id")?;
            out.insert(sensor_id, binding_id);
        }
        Ok(out)
    }

    async fn insert_measurements(&self, rows: &[MeasurementRow], chunk_size: usize) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(chunk_size.max(1)) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO timeseries.measurements (measurement_timestamp, test_relation_id, measurement_channel, measurement_value) ",
            );
            builder.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.timestamp)
                    .push_bind(row.binding_id)
                    .push_bind(row.channel.as_ref())
                    .push_bind(row.value);
            });
            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn mark_sensor_online(&self, sensor_id: SensorId, seen_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE metadata.sensors
            SET sensor_is_online = TRUE,
                sensor_last_seen = $2
            WHERE id = $1
            "#,
        )
        .bind(sensor_id)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_stale_sensors_offline(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE metadata.sensors
            SET sensor_is_online = FALSE
            WHERE sensor_is_online
              AND (sensor_last_seen IS NULL OR sensor_last_seen < $1)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
