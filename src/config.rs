use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Settings that may also come from the JSON file named by `INGEST_CONFIG_PATH`.
/// A value here only applies when the matching environment variable is unset.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileOverrides {
    database_url: Option<String>,
    db_pool_size: Option<u32>,
    db_statement_timeout_ms: Option<u64>,
    mqtt_host: Option<String>,
    mqtt_port: Option<u16>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_client_id: Option<String>,
    mqtt_keepalive_secs: Option<u64>,
    mqtt_topic_prefix: Option<String>,
    mqtt_reconnect_min_ms: Option<u64>,
    mqtt_reconnect_max_ms: Option<u64>,
    binding_refresh_ms: Option<u64>,
    flush_interval_ms: Option<u64>,
    max_buffer_size: Option<usize>,
    insert_chunk_size: Option<usize>,
    max_queue: Option<usize>,
    heartbeat_timeout_secs: Option<u64>,
    dead_letter_path: Option<String>,
    status_log_interval_ms: Option<u64>,
}

/// Config is loaded before tracing is installed, so a bad file is an error rather than a warning.
fn load_file_overrides(path: &Path) -> Result<FileOverrides> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes)
        .with_context(|| format!("parse config file {}", path.display()))
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub db_statement_timeout_ms: u64,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_topic_prefix: String,
    pub mqtt_reconnect_min_ms: u64,
    pub mqtt_reconnect_max_ms: u64,
    pub binding_refresh_ms: u64,
    pub flush_interval_ms: u64,
    pub max_buffer_size: usize,
    pub insert_chunk_size: usize,
    pub max_queue: usize,
    pub heartbeat_timeout_secs: u64,
    pub dead_letter_path: PathBuf,
    pub status_log_interval_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source. `from_env` passes the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let file = match var("INGEST_CONFIG_PATH") {
            Some(path) => load_file_overrides(Path::new(&path))?,
            None => FileOverrides::default(),
        };

        let database_url = var("INGEST_DATABASE_URL")
            .or_else(|| var("DATABASE_URL"))
            .or_else(|| non_empty(file.database_url.as_deref()))
            .context("INGEST_DATABASE_URL or DATABASE_URL is required (or database_url in the config file)")?;
        let database_url = normalize_database_url(database_url);

        let mqtt_host = var("INGEST_MQTT_HOST")
            .or_else(|| var("MQTT_BROKER"))
            .or_else(|| non_empty(file.mqtt_host.as_deref()))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_username =
            var("INGEST_MQTT_USERNAME").or_else(|| non_empty(file.mqtt_username.as_deref()));
        let mqtt_password =
            var("INGEST_MQTT_PASSWORD").or_else(|| non_empty(file.mqtt_password.as_deref()));
        let mqtt_client_id = var("INGEST_MQTT_CLIENT_ID")
            .or_else(|| non_empty(file.mqtt_client_id.as_deref()))
            .unwrap_or_else(|| format!("telemetry-worker-{}", std::process::id()));
        let mqtt_topic_prefix = var("INGEST_MQTT_TOPIC_PREFIX")
            .or_else(|| non_empty(file.mqtt_topic_prefix.as_deref()))
            .map(|prefix| prefix.trim_matches('/').to_string())
            .unwrap_or_else(|| "sensors".to_string());
        let dead_letter_path = var("INGEST_DEAD_LETTER_PATH")
            .or_else(|| non_empty(file.dead_letter_path.as_deref()))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("dead_letters.log"));

        let binding_refresh_ms = match parsed::<u64, _>(&var, "INGEST_BINDING_REFRESH_MS")? {
            Some(value) => Some(value),
            None => parsed::<f64, _>(&var, "BINDING_REFRESH_SEC")?.map(seconds_to_ms),
        };
        let flush_interval_ms = match parsed::<u64, _>(&var, "INGEST_FLUSH_INTERVAL_MS")? {
            Some(value) => Some(value),
            None => parsed::<f64, _>(&var, "FLUSH_INTERVAL_SEC")?.map(seconds_to_ms),
        };

        let config = Self {
            database_url,
            db_pool_size: parsed(&var, "INGEST_DB_POOL_SIZE")?
                .or(file.db_pool_size)
                .unwrap_or(10),
            db_statement_timeout_ms: parsed(&var, "INGEST_DB_STATEMENT_TIMEOUT_MS")?
                .or(file.db_statement_timeout_ms)
                .unwrap_or(10_000),
            mqtt_host,
            mqtt_port: first_parsed(&var, &["INGEST_MQTT_PORT", "MQTT_PORT"])?
                .or(file.mqtt_port)
                .unwrap_or(1883),
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keepalive_secs: parsed(&var, "INGEST_MQTT_KEEPALIVE_SECS")?
                .or(file.mqtt_keepalive_secs)
                .unwrap_or(30),
            mqtt_topic_prefix,
            mqtt_reconnect_min_ms: parsed(&var, "INGEST_MQTT_RECONNECT_MIN_MS")?
                .or(file.mqtt_reconnect_min_ms)
                .unwrap_or(500),
            mqtt_reconnect_max_ms: parsed(&var, "INGEST_MQTT_RECONNECT_MAX_MS")?
                .or(file.mqtt_reconnect_max_ms)
                .unwrap_or(30_000),
            binding_refresh_ms: binding_refresh_ms
                .or(file.binding_refresh_ms)
                .unwrap_or(5_000),
            flush_interval_ms: flush_interval_ms
                .or(file.flush_interval_ms)
                .unwrap_or(10_000),
            max_buffer_size: first_parsed(&var, &["INGEST_MAX_BUFFER_SIZE", "MAX_BUFFER_SIZE"])?
                .or(file.max_buffer_size)
                .unwrap_or(5_000),
            insert_chunk_size: parsed(&var, "INGEST_INSERT_CHUNK_SIZE")?
                .or(file.insert_chunk_size)
                .unwrap_or(1_000),
            max_queue: parsed(&var, "INGEST_MAX_QUEUE")?
                .or(file.max_queue)
                .unwrap_or(1_024),
            heartbeat_timeout_secs: parsed(&var, "INGEST_HEARTBEAT_TIMEOUT_SECS")?
                .or(file.heartbeat_timeout_secs)
                .unwrap_or(30),
            dead_letter_path,
            status_log_interval_ms: parsed(&var, "INGEST_STATUS_LOG_INTERVAL_MS")?
                .or(file.status_log_interval_ms)
                .unwrap_or(10_000),
            otlp_endpoint: var("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("db_pool_size", self.db_pool_size as u64),
            ("db_statement_timeout_ms", self.db_statement_timeout_ms),
            ("mqtt_port", self.mqtt_port as u64),
            ("mqtt_keepalive_secs", self.mqtt_keepalive_secs),
            ("mqtt_reconnect_min_ms", self.mqtt_reconnect_min_ms),
            ("binding_refresh_ms", self.binding_refresh_ms),
            ("flush_interval_ms", self.flush_interval_ms),
            ("max_buffer_size", self.max_buffer_size as u64),
            ("insert_chunk_size", self.insert_chunk_size as u64),
            ("max_queue", self.max_queue as u64),
            ("heartbeat_timeout_secs", self.heartbeat_timeout_secs),
            ("status_log_interval_ms", self.status_log_interval_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.mqtt_topic_prefix.is_empty() {
            bail!("mqtt_topic_prefix must not be empty");
        }
        if self.mqtt_topic_prefix.contains(['+', '#']) {
            bail!(
                "mqtt_topic_prefix {:?} must not contain MQTT wildcards",
                self.mqtt_topic_prefix
            );
        }
        if self.mqtt_reconnect_max_ms < self.mqtt_reconnect_min_ms {
            bail!(
                "mqtt_reconnect_max_ms ({}) is below mqtt_reconnect_min_ms ({})",
                self.mqtt_reconnect_max_ms,
                self.mqtt_reconnect_min_ms
            );
        }
        Ok(())
    }

    pub fn db_statement_timeout(&self) -> Duration {
        Duration::from_millis(self.db_statement_timeout_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.mqtt_reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.mqtt_reconnect_max_ms)
    }

    pub fn binding_refresh(&self) -> Duration {
        Duration::from_millis(self.binding_refresh_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_millis(self.status_log_interval_ms)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parsed<T, V>(var: &V, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow!("invalid {key}={raw:?}: {err}")),
        None => Ok(None),
    }
}

fn first_parsed<T, V>(var: &V, keys: &[&str]) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    V: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = parsed(var, key)? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1000.0).round() as u64
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
