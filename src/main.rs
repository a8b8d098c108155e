//! streamforged: composition root
//!
//! Freezes configuration from the environment, constructs every component
//! explicitly, wires them together, and runs until ctrl-c. Shutdown
//! propagates one cancellation token: ingest stops accepting, supervisors
//! stop their children, and the process waits (bounded) for the registry
//! to drain.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use streamforge::config::Config;
use streamforge::controller::{AllowAll, PublishController};
use streamforge::hls::{ArtifactStore, HlsHealthMonitor};
use streamforge::http::{self, AppState};
use streamforge::ingest::IngestServer;
use streamforge::registry::StreamRegistry;
use streamforge::supervisor::SupervisorContext;

/// How long shutdown waits for supervisors to finish teardown
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(config_from_env()?);
    config
        .validate()
        .map_err(|reason| anyhow::anyhow!("invalid configuration: {reason}"))?;

    tracing::info!(
        rtmp = %config.rtmp.bind_addr,
        http = %config.http.bind_addr,
        hls_root = %config.hls.root.display(),
        ladder_rungs = config.ladder.len(),
        retention_hours = config.retention.hours,
        "streamforge starting"
    );

    let cancel = CancellationToken::new();

    let registry = Arc::new(StreamRegistry::new());
    let store = Arc::new(ArtifactStore::new(config.hls.root.clone()));
    let health = Arc::new(HlsHealthMonitor::new(
        config.hls.root.clone(),
        config.hls.freshness,
    ));

    let supervisor_ctx = SupervisorContext {
        config: config.supervisor.clone(),
        hls: config.hls.clone(),
        store: Arc::clone(&store),
        health: Arc::clone(&health),
        registry: Arc::clone(&registry),
        cancel: cancel.clone(),
    };
    let controller = Arc::new(PublishController::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        supervisor_ctx,
        Arc::new(AllowAll),
    ));

    // Retention sweeper: frequent enough to be well inside the retention
    // window, never busier than hourly
    let sweep_interval = if config.retention.hours == 0 {
        Duration::from_secs(3600)
    } else {
        Duration::from_secs(u64::from(config.retention.hours) * 3600 / 4).min(Duration::from_secs(3600))
    };
    let _sweeper = store.spawn_sweeper(sweep_interval, cancel.clone());

    // HLS delivery + control surface
    let app = http::router(AppState {
        registry: Arc::clone(&registry),
        store: Arc::clone(&store),
        health: Arc::clone(&health),
        controller: Arc::clone(&controller),
    });
    let http_listener = TcpListener::bind(config.http.bind_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {}", config.http.bind_addr))?;
    tracing::info!(addr = %config.http.bind_addr, "HLS delivery listening");

    let http_cancel = cancel.clone();
    let http_task = tokio::spawn(async move {
        let shutdown = async move { http_cancel.cancelled().await };
        if let Err(e) = axum::serve(http_listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // RTMP ingest in the foreground until ctrl-c
    let ingest = IngestServer::new(
        config.rtmp.clone(),
        Arc::clone(&controller),
        Arc::clone(&registry),
    );

    tokio::select! {
        result = ingest.run_until(cancel.clone()) => {
            result.context("RTMP ingest failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    // Propagate cancellation and wait for supervisors to tear down
    cancel.cancel();
    let drain_deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
    while registry.count().await > 0 && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    let leftover = registry.count().await;
    if leftover > 0 {
        tracing::warn!(leftover, "Shutdown drain incomplete");
    }

    let _ = http_task.await;
    tracing::info!("streamforge stopped");
    Ok(())
}

/// Freeze the recognized options from the environment
fn config_from_env() -> anyhow::Result<Config> {
    let mut config = Config::default();

    if let Some(port) = env_parse::<u16>("STREAMFORGE_RTMP_PORT")? {
        config.rtmp.bind_addr.set_port(port);
    }
    if let Some(addr) = env_parse::<IpAddr>("STREAMFORGE_BIND_ADDR")? {
        config.rtmp.bind_addr = SocketAddr::new(addr, config.rtmp.bind_addr.port());
        config.http.bind_addr = SocketAddr::new(addr, config.http.bind_addr.port());
    }
    if let Some(app) = std::env::var("STREAMFORGE_APP_NAME").ok().filter(|s| !s.is_empty()) {
        config.rtmp.app_name = app;
    }
    if let Some(root) = std::env::var("STREAMFORGE_HLS_ROOT").ok().filter(|s| !s.is_empty()) {
        config.hls.root = PathBuf::from(root);
    }
    if let Some(seconds) = env_parse::<u32>("STREAMFORGE_SEGMENT_SECONDS")? {
        config.hls.segment_seconds = seconds;
    }
    if let Some(segments) = env_parse::<u32>("STREAMFORGE_PLAYLIST_SEGMENTS")? {
        config.hls.playlist_segments = segments;
    }
    if let Some(seconds) = env_parse::<u64>("STREAMFORGE_FRESHNESS_SECONDS")? {
        config.hls.freshness = Duration::from_secs(seconds);
    }
    if let Some(seconds) = env_parse::<u64>("STREAMFORGE_STARTUP_GRACE_SECONDS")? {
        config.supervisor.startup_grace = Duration::from_secs(seconds);
    }
    if let Some(seconds) = env_parse::<u64>("STREAMFORGE_STOP_GRACE_SECONDS")? {
        config.supervisor.stop_grace = Duration::from_secs(seconds);
    }
    if let Some(hours) = env_parse::<u32>("STREAMFORGE_RETENTION_HOURS")? {
        config.retention.hours = hours;
    }
    if let Some(dir) = std::env::var("STREAMFORGE_LOCK_DIR").ok().filter(|s| !s.is_empty()) {
        config.supervisor.lock_dir = PathBuf::from(dir);
    }
    if let Some(bin) = std::env::var("STREAMFORGE_FFMPEG_BIN").ok().filter(|s| !s.is_empty()) {
        config.supervisor.ffmpeg_bin = bin;
    }
    if let Some(port) = env_parse::<u16>("STREAMFORGE_HTTP_PORT")? {
        config.http.bind_addr.set_port(port);
    }

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => {
            let parsed = value
                .parse()
                .with_context(|| format!("parsing {name}={value}"))?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}
