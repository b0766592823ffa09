use crate::bucket::BucketWidth;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "config/windfarm.json";

fn setup_config_path() -> PathBuf {
    env::var("WINDFARM_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    http_bind: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    enable_mqtt_listener: Option<bool>,
    #[serde(default)]
    dataset_path: Option<String>,
    #[serde(default)]
    emitter_enabled: Option<bool>,
    #[serde(default)]
    emit_accelerate: Option<bool>,
    #[serde(default)]
    seed_enabled: Option<bool>,
    #[serde(default)]
    seed_minutes: Option<usize>,
    #[serde(default)]
    live_retention_minutes: Option<i64>,
    #[serde(default)]
    min_forecast_window_minutes: Option<i64>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    flush_interval_ms: Option<u64>,
    #[serde(default)]
    max_queue: Option<usize>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_overrides(contents, &path)
}

fn parse_setup_overrides(contents: String, path: &std::path::Path) -> Option<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn env_allows(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_none()
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) -> Result<()> {
    if env_allows("WINDFARM_DATABASE_URL") && env_allows("DATABASE_URL") {
        if let Some(url) = non_blank(overrides.database_url.as_deref()) {
            config.database_url = Some(normalize_database_url(url));
        }
    }
    if env_allows("WINDFARM_HTTP_BIND") {
        if let Some(bind) = non_blank(overrides.http_bind.as_deref()) {
            config.http_bind = bind
                .parse()
                .with_context(|| format!("invalid http_bind in setup config: {bind}"))?;
        }
    }
    if env_allows("WINDFARM_MQTT_HOST") {
        if let Some(host) = non_blank(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if env_allows("WINDFARM_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("WINDFARM_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_blank(Some(username));
        }
    }
    if env_allows("WINDFARM_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_blank(Some(password));
        }
    }
    if env_allows("WINDFARM_MQTT_TOPIC_PREFIX") {
        if let Some(prefix) = non_blank(overrides.mqtt_topic_prefix.as_deref()) {
            config.mqtt_topic_prefix = prefix;
        }
    }
    if env_allows("WINDFARM_ENABLE_MQTT") {
        if let Some(value) = overrides.enable_mqtt_listener {
            config.enable_mqtt_listener = value;
        }
    }
    if env_allows("WINDFARM_DATASET_PATH") {
        if let Some(path) = non_blank(overrides.dataset_path.as_deref()) {
            config.dataset_path = PathBuf::from(path);
        }
    }
    if env_allows("WINDFARM_EMITTER_ENABLED") {
        if let Some(value) = overrides.emitter_enabled {
            config.emitter_enabled = value;
        }
    }
    if env_allows("WINDFARM_EMIT_ACCELERATE") {
        if let Some(value) = overrides.emit_accelerate {
            config.emit_accelerate = value;
        }
    }
    if env_allows("WINDFARM_SEED_ENABLED") {
        if let Some(value) = overrides.seed_enabled {
            config.seed_enabled = value;
        }
    }
    if env_allows("WINDFARM_SEED_MINUTES") {
        if let Some(value) = overrides.seed_minutes.filter(|v| *v != 0) {
            config.seed_minutes = value;
        }
    }
    if env_allows("WINDFARM_LIVE_RETENTION_MINUTES") {
        if let Some(value) = overrides.live_retention_minutes.filter(|v| *v > 0) {
            config.live_retention_minutes = value;
        }
    }
    if env_allows("WINDFARM_MIN_FORECAST_WINDOW_MINUTES") {
        if let Some(value) = overrides.min_forecast_window_minutes.filter(|v| *v >= 0) {
            config.min_forecast_window_minutes = value;
        }
    }

    let mut batch_overridden = false;
    if env_allows("WINDFARM_BATCH_SIZE") {
        if let Some(value) = overrides.batch_size.filter(|v| *v != 0) {
            config.batch_size = value;
            batch_overridden = true;
        }
    }
    if env_allows("WINDFARM_FLUSH_INTERVAL_MS") {
        if let Some(value) = overrides.flush_interval_ms.filter(|v| *v != 0) {
            config.flush_interval_ms = value;
        }
    }
    if env_allows("WINDFARM_MAX_QUEUE") {
        if let Some(value) = overrides.max_queue.filter(|v| *v != 0) {
            config.max_queue = value;
        } else if batch_overridden {
            config.max_queue = config.batch_size.saturating_mul(10);
        }
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub http_bind: SocketAddr,
    /// `None` keeps telemetry in process memory.
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub bucket_width: BucketWidth,
    pub live_retention_minutes: i64,
    pub min_forecast_window_minutes: i64,
    pub subscriber_buffer: usize,
    pub subscriber_max_drops: u64,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub request_timeout_ms: u64,
    pub sse_keepalive_secs: u64,
    pub dataset_path: PathBuf,
    pub emitter_enabled: bool,
    pub emit_interval_ms: u64,
    pub emit_accelerated_interval_ms: u64,
    pub emit_accelerate: bool,
    pub seed_enabled: bool,
    pub seed_minutes: usize,
    pub enable_mqtt_listener: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let batch_size = 500;
        Self {
            http_bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            database_url: None,
            db_pool_size: 10,
            bucket_width: BucketWidth::ONE_MINUTE,
            live_retention_minutes: 240,
            min_forecast_window_minutes: 180,
            subscriber_buffer: 256,
            subscriber_max_drops: 1024,
            batch_size,
            flush_interval_ms: 200,
            max_queue: batch_size * 10,
            request_timeout_ms: 10_000,
            sse_keepalive_secs: 30,
            dataset_path: PathBuf::from("data/device_energy_data.csv"),
            emitter_enabled: false,
            emit_interval_ms: 60_000,
            emit_accelerated_interval_ms: 1_000,
            emit_accelerate: false,
            seed_enabled: false,
            seed_minutes: 180,
            enable_mqtt_listener: false,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic_prefix: "windfarm".to_string(),
            mqtt_keepalive_secs: 30,
            mqtt_client_id: format!("windfarm-telemetry-{}", std::process::id()),
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let defaults = Self::default();
        let setup_overrides = load_setup_config_overrides();

        let http_bind = match env::var("WINDFARM_HTTP_BIND") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<SocketAddr>()
                .with_context(|| format!("WINDFARM_HTTP_BIND is not a socket address: {raw}"))?,
            _ => defaults.http_bind,
        };
        let database_url = env::var("WINDFARM_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .and_then(|value| non_blank(Some(&value)))
            .map(normalize_database_url);

        let bucket_width = match env_parse::<i64>("WINDFARM_BUCKET_SECONDS") {
            Some(seconds) => BucketWidth::from_seconds(seconds)
                .context("WINDFARM_BUCKET_SECONDS must be positive")?,
            None => defaults.bucket_width,
        };

        let batch_size = env_parse("WINDFARM_BATCH_SIZE").unwrap_or(defaults.batch_size);
        let max_queue = env_parse("WINDFARM_MAX_QUEUE").unwrap_or(batch_size * 10);

        let mut config = Self {
            http_bind,
            database_url,
            db_pool_size: env_parse("WINDFARM_DB_POOL_SIZE").unwrap_or(defaults.db_pool_size),
            bucket_width,
            live_retention_minutes: env_parse("WINDFARM_LIVE_RETENTION_MINUTES")
                .unwrap_or(defaults.live_retention_minutes),
            min_forecast_window_minutes: env_parse("WINDFARM_MIN_FORECAST_WINDOW_MINUTES")
                .unwrap_or(defaults.min_forecast_window_minutes),
            subscriber_buffer: env_parse("WINDFARM_SUBSCRIBER_BUFFER")
                .unwrap_or(defaults.subscriber_buffer),
            subscriber_max_drops: env_parse("WINDFARM_SUBSCRIBER_MAX_DROPS")
                .unwrap_or(defaults.subscriber_max_drops),
            batch_size,
            flush_interval_ms: env_parse("WINDFARM_FLUSH_INTERVAL_MS")
                .unwrap_or(defaults.flush_interval_ms),
            max_queue,
            request_timeout_ms: env_parse("WINDFARM_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout_ms),
            sse_keepalive_secs: env_parse("WINDFARM_SSE_KEEPALIVE_SECS")
                .unwrap_or(defaults.sse_keepalive_secs),
            dataset_path: env::var("WINDFARM_DATASET_PATH")
                .ok()
                .and_then(|value| non_blank(Some(&value)))
                .map(PathBuf::from)
                .unwrap_or(defaults.dataset_path),
            emitter_enabled: env_flag("WINDFARM_EMITTER_ENABLED", defaults.emitter_enabled),
            emit_interval_ms: env_parse("WINDFARM_EMIT_INTERVAL_MS")
                .unwrap_or(defaults.emit_interval_ms),
            emit_accelerated_interval_ms: env_parse("WINDFARM_EMIT_ACCELERATED_INTERVAL_MS")
                .unwrap_or(defaults.emit_accelerated_interval_ms),
            emit_accelerate: env_flag("WINDFARM_EMIT_ACCELERATE", defaults.emit_accelerate),
            seed_enabled: env_flag("WINDFARM_SEED_ENABLED", defaults.seed_enabled),
            seed_minutes: env_parse("WINDFARM_SEED_MINUTES").unwrap_or(defaults.seed_minutes),
            enable_mqtt_listener: env_flag("WINDFARM_ENABLE_MQTT", defaults.enable_mqtt_listener),
            mqtt_host: env::var("WINDFARM_MQTT_HOST").unwrap_or(defaults.mqtt_host),
            mqtt_port: env_parse("WINDFARM_MQTT_PORT").unwrap_or(defaults.mqtt_port),
            mqtt_username: env::var("WINDFARM_MQTT_USERNAME").ok(),
            mqtt_password: env::var("WINDFARM_MQTT_PASSWORD").ok(),
            mqtt_topic_prefix: env::var("WINDFARM_MQTT_TOPIC_PREFIX")
                .unwrap_or(defaults.mqtt_topic_prefix),
            mqtt_keepalive_secs: env_parse("WINDFARM_MQTT_KEEPALIVE_SECS")
                .unwrap_or(defaults.mqtt_keepalive_secs),
            mqtt_client_id: env::var("WINDFARM_MQTT_CLIENT_ID").unwrap_or(defaults.mqtt_client_id),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides)?;
        }

        Ok(config)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sse_keepalive(&self) -> Duration {
        Duration::from_secs(self.sse_keepalive_secs.max(1))
    }

    /// Replay cadence, honouring the accelerate switch.
    pub fn emit_interval(&self) -> Duration {
        let ms = if self.emit_accelerate {
            self.emit_accelerated_interval_ms
        } else {
            self.emit_interval_ms
        };
        Duration::from_millis(ms.max(1))
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("jdbc:postgresql://") {
        return format!("postgresql://{stripped}");
    }
    url
}
