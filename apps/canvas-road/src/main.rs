mod config;
mod messages;
mod redis_store;
mod routes;
mod session;
mod state;
mod telemetry;
mod watch;
mod websocket;

use std::sync::Arc;

use anyhow::{Context, Result};
use canvas_bus::{Bus, LocalBus, RedisBus, RedisBusConfig};
use canvas_core::{Backends, Canvas, MemoryStore};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

use crate::config::{Cli, Commands, ServerConfig};
use crate::redis_store::{RedisStore, RedisStoreConfig};
use crate::session::{SessionConfig, SessionRegistry};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    if let Some(Commands::Watch {
        url,
        actor,
        snapshot,
    }) = cli.command
    {
        return watch::run_watch_client(url, actor, snapshot).await;
    }

    let config = ServerConfig::try_from(cli.server)?;
    info!(
        listen_addr = %config.listen_addr,
        width = config.canvas.grid.width,
        height = config.canvas.grid.height,
        zone_size = config.canvas.zone_size,
        in_memory = config.in_memory,
        "starting canvas-road"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn connect_backends(config: &ServerConfig) -> Result<Backends> {
    if config.in_memory {
        warn!("using in-memory backends; state is lost on exit and not shared between instances");
        let memory = MemoryStore::with_log_max_len(config.activity_log_max_len);
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
        return Ok(Backends::in_memory(memory, bus));
    }

    info!(redis_url = %config.redis_url, "connecting to redis");
    let store = Arc::new(
        RedisStore::connect(
            &config.redis_url,
            RedisStoreConfig {
                log_max_len: config.activity_log_max_len,
                series_retention: config.canvas.zone_retention,
            },
        )
        .await?,
    );
    let bus = RedisBus::connect(RedisBusConfig::new(
        config.redis_url.clone(),
        vec![config.canvas.keys.updates_topic()],
    ))
    .await
    .context("failed to subscribe to the update channel")?;

    Ok(Backends {
        fields: store.clone(),
        sets: store.clone(),
        documents: store.clone(),
        series: store.clone(),
        log: store,
        bus: Arc::new(bus),
    })
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let backends = connect_backends(&config).await?;
    let canvas = Canvas::new(config.canvas.clone(), backends).context("invalid canvas config")?;
    canvas
        .initialize()
        .await
        .context("failed to initialize canvas")?;

    let refresh_handle = config.snapshot_refresh.map(|period| {
        info!(period_secs = period.as_secs(), "periodic snapshot refresh enabled");
        canvas.spawn_periodic_refresh(period)
    });

    let registry = SessionRegistry::new(SessionConfig {
        idle_timeout: config.idle_timeout,
        ..SessionConfig::default()
    });
    let fanout_handle = websocket::spawn_fanout(canvas.subscribe(), registry.clone());
    let recycler_handle = registry.spawn_recycler();

    let state = AppState::new(
        canvas.clone(),
        registry,
        metrics,
        config.admin_token.clone(),
    );
    let router = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("canvas-road listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; draining background work"
    );
    fanout_handle.abort();
    recycler_handle.abort();
    if let Some(handle) = refresh_handle {
        handle.abort();
    }
    if tokio::time::timeout(config.shutdown_grace, canvas.settle())
        .await
        .is_err()
    {
        warn!("background work still pending after grace period");
    }
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
