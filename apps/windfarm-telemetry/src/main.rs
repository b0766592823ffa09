use anyhow::{Context, Result};
use clap::Parser;
use futures::future;
use std::sync::Arc;
use tokio::net::TcpListener;
use windfarm_telemetry::cli::Args;
use windfarm_telemetry::config::Config;
use windfarm_telemetry::dataset::{self, Dataset};
use windfarm_telemetry::emitter::spawn_emitter;
use windfarm_telemetry::engine::TelemetryEngine;
use windfarm_telemetry::fanout::SubscriptionHub;
use windfarm_telemetry::ingest::{LiveAggregator, TelemetryIngestor};
use windfarm_telemetry::pipeline::{self, WorkerSettings};
use windfarm_telemetry::state::AppState;
use windfarm_telemetry::store::{MemoryTelemetryStore, PgTelemetryStore, TelemetryStore};
use windfarm_telemetry::{mqtt, routes};

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,windfarm_telemetry=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let endpoint = config
        .otlp_endpoint
        .as_deref()
        .map(normalize_otlp_http_endpoint)
        .filter(|endpoint| !endpoint.is_empty());

    if let Some(endpoint) = endpoint {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "windfarm-telemetry"),
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

async fn open_store(config: &Config) -> Result<Arc<dyn TelemetryStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgTelemetryStore::connect(url, config.db_pool_size)
                .await
                .context("failed to connect telemetry database")?;
            tracing::info!(pool_size = config.db_pool_size, "using PostgreSQL telemetry store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("no database configured; keeping telemetry in memory");
            Ok(Arc::new(MemoryTelemetryStore::new()))
        }
    }
}

async fn bind_listener(config: &Config) -> Result<TcpListener> {
    let addr = config.http_bind;
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind windfarm-telemetry on {addr}: port already in use. Stop the other service or re-run with --http-bind to choose another address.",
            );
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind windfarm-telemetry on {addr}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    args.apply(&mut config);
    init_tracing(&config)?;

    let store = open_store(&config).await?;
    let live = Arc::new(LiveAggregator::new(
        config.bucket_width,
        config.live_retention_minutes,
    ));
    let (pipeline, worker_handle) = pipeline::start(
        store.clone(),
        WorkerSettings {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            max_queue: config.max_queue,
        },
    );
    let hub = SubscriptionHub::new(config.subscriber_buffer, config.subscriber_max_drops);
    let ingestor = TelemetryIngestor::new(live.clone(), pipeline, store.clone(), hub);
    let engine = TelemetryEngine::new(store.clone(), live, config.min_forecast_window_minutes);

    let dataset = if config.seed_enabled || config.emitter_enabled {
        match Dataset::load(&config.dataset_path) {
            Ok(dataset) => Some(dataset),
            Err(err) => {
                tracing::warn!(error = %err, "dataset unavailable; seeding and replay disabled");
                None
            }
        }
    } else {
        None
    };

    if let (true, Some(dataset)) = (config.seed_enabled, dataset.as_ref()) {
        if let Err(err) = dataset::seed_store(store.as_ref(), dataset, config.seed_minutes).await {
            tracing::warn!(error = %err, "seeding failed");
        }
    }

    let emitter_handle = match (config.emitter_enabled, dataset.as_ref()) {
        (true, Some(dataset)) => Some(spawn_emitter(
            dataset,
            config.emit_interval(),
            ingestor.clone(),
        )),
        _ => None,
    };

    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let ingestor_clone = ingestor.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, ingestor_clone).await
        }))
    } else {
        None
    };

    let state = AppState::new(engine, ingestor.clone(), config.sse_keepalive());
    let app = routes::router(state, config.request_timeout());
    let listener = bind_listener(&config).await?;
    tracing::info!(addr = %config.http_bind, store = store.name(), "windfarm telemetry listening");
    let http_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        res = http_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server failed"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = async {
            if let Some(handle) = mqtt_handle {
                match handle.await {
                    Ok(Err(err)) => tracing::warn!(error=%err, "MQTT listener exited"),
                    Err(err) => tracing::warn!(error=%err, "MQTT task failed"),
                    Ok(Ok(())) => {}
                }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    if let Some(handle) = emitter_handle {
        handle.abort();
    }
    if let Err(err) = ingestor.flush().await {
        tracing::warn!(error=%err, "final flush failed");
    }
    drop(ingestor);
    worker_handle.abort();

    Ok(())
}
