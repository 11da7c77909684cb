mod config;
mod dead_letter;
mod error;
mod ingest;
mod mqtt;
mod pipeline;
mod store;
mod telemetry;

use crate::config::Config;
use crate::ingest::{liveness, spawn_binding_refresher, IngestLimits, TelemetryIngestor};
use crate::pipeline::{
    spawn_flusher, spawn_processor, spawn_status_reporter, IngestCommand, IngestStats,
    PipelineHandle,
};
use crate::store::{build_pool, PgStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_worker=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "telemetry-worker"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    tracing::info!(
        prefix = %config.mqtt_topic_prefix,
        max_buffer_size = config.max_buffer_size,
        flush_interval_ms = config.flush_interval_ms,
        binding_refresh_ms = config.binding_refresh_ms,
        heartbeat_timeout_secs = config.heartbeat_timeout_secs,
        "telemetry worker starting"
    );

    let pool = build_pool(
        &config.database_url,
        config.db_pool_size,
        config.db_statement_timeout(),
    )
    .await?;
    let store = Arc::new(PgStore::new(pool));
    let stats = Arc::new(IngestStats::new());

    let (dead_letters, dead_letter_rx) = dead_letter::channel(stats.clone());
    let dead_letter_path = config.dead_letter_path.clone();
    let dead_letter_writer = tokio::spawn(async move {
        if let Err(err) = dead_letter::run_writer(dead_letter_path, dead_letter_rx).await {
            tracing::error!(error = %err, "dead-letter writer exited");
        }
    });

    let ingestor = TelemetryIngestor::new(
        store,
        dead_letters.clone(),
        stats.clone(),
        IngestLimits {
            max_buffer_size: config.max_buffer_size,
            insert_chunk_size: config.insert_chunk_size,
        },
        config.heartbeat_timeout(),
    );
    if let Err(err) = ingestor.refresh_bindings().await {
        tracing::warn!(error = %err, "initial binding load failed; retrying on the refresh interval");
    }

    let (tx, rx) = mpsc::channel::<IngestCommand>(config.max_queue);
    let pipeline = PipelineHandle::new(tx, stats.clone());
    let (liveness_handle, heartbeat_rx) = liveness::channel();

    let mut processor = spawn_processor(ingestor.clone(), rx);
    let refresher = spawn_binding_refresher(ingestor.clone(), config.binding_refresh());
    let flusher = spawn_flusher(ingestor.clone(), config.flush_interval());
    let liveness_task = liveness::spawn_liveness_tracker(ingestor.clone(), heartbeat_rx);
    let status_reporter = spawn_status_reporter(ingestor.clone(), config.status_log_interval());

    let mut mqtt_task = {
        let config = config.clone();
        let pipeline = pipeline.clone();
        let dead_letters = dead_letters.clone();
        tokio::spawn(async move {
            mqtt::run_listener(config, pipeline, liveness_handle, dead_letters).await
        })
    };

    tokio::select! {
        res = &mut mqtt_task => {
            match res {
                Ok(Ok(())) => tracing::warn!("MQTT listener returned"),
                Ok(Err(err)) => tracing::error!(error = %err, "MQTT listener failed"),
                Err(err) => tracing::error!(error = %err, "MQTT task panicked"),
            }
        }
        res = &mut processor => {
            if let Err(err) = res {
                tracing::error!(error = %err, "message processor panicked");
            } else {
                tracing::error!("message processor exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    mqtt_task.abort();
    refresher.abort();
    flusher.abort();
    liveness_task.abort();
    status_reporter.abort();

    match tokio::time::timeout(SHUTDOWN_GRACE, pipeline.flush()).await {
        Ok(Ok(())) => tracing::info!(
            rows_written = stats.rows_written.load(std::sync::atomic::Ordering::Relaxed),
            "final flush complete"
        ),
        Ok(Err(err)) => tracing::warn!(error = %err, "final flush skipped"),
        Err(_) => tracing::warn!("final flush timed out; buffered rows lost"),
    }

    drop(pipeline);
    drop(ingestor);
    drop(dead_letters);
    if tokio::time::timeout(SHUTDOWN_GRACE, dead_letter_writer)
        .await
        .is_err()
    {
        tracing::warn!("dead-letter writer did not drain before shutdown");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn otlp_endpoint_gets_trace_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}
