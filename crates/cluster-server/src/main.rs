use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use cluster_bridge::auth::StaticBootstrapToken;
use cluster_bridge::event_bus::EventBus;
use cluster_bridge::ws::{self, AppState};
use cluster_core::config::ClusterConfig;
use cluster_core::store::Store;
use cluster_registry::Registry;
use tracing::info;

mod shutdown;
mod watchdog;

use shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<()> {
    cluster_telemetry::init_logging("cluster-server", "info");

    let config = ClusterConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ClusterConfig::default()
    });

    let db_path = shellexpand_home(&config.store.db_path);
    let store = Arc::new(
        Store::new(&db_path, config.staleness)
            .await
            .with_context(|| format!("failed to open store at {db_path}"))?,
    );
    let registry = Arc::new(Registry::new());
    let event_bus = Arc::new(EventBus::new(config.control.intent_queue_depth));

    let bootstrap_token = std::env::var("CLUSTER_BOOTSTRAP_TOKEN").unwrap_or_else(|_| {
        let generated = uuid::Uuid::new_v4().to_string();
        tracing::warn!(token = %generated, "CLUSTER_BOOTSTRAP_TOKEN not set, generated an ephemeral one");
        generated
    });
    let token_issuer = Arc::new(StaticBootstrapToken::new(bootstrap_token));

    let host = std::env::var("CLUSTER_BIND_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("CLUSTER_BIND_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(7565);
    let bind_addr = format!("{host}:{port}");

    let state = Arc::new(AppState {
        store: store.clone(),
        registry: registry.clone(),
        event_bus: event_bus.clone(),
        token_issuer,
        config: Arc::new(config),
        bind_address: bind_addr.clone(),
    });

    let app = ws::router(state).route("/healthz", get(healthz));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind on {bind_addr}"))?;
    info!(%bind_addr, "cluster-server listening");

    let shutdown = ShutdownSignal::new();
    let watchdog_handle = tokio::spawn(watchdog::run(store.clone(), event_bus.clone(), shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown, registry, store, event_bus))
        .await
        .context("server execution failed")?;

    watchdog_handle.await.ok();
    info!("cluster-server shut down cleanly");
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Await ctrl-c, then drain the whole server: stop the watchdog, close every
/// live channel kind, mark every daemon disconnected in the store, drain the
/// event bus, and close the store. Completes before `axum::serve`'s graceful
/// shutdown finishes waiting, so connections are cut only after the cleanup
/// below has already run.
async fn wait_for_shutdown(shutdown: ShutdownSignal, registry: Arc<Registry>, store: Arc<Store>, event_bus: Arc<EventBus>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    info!("ctrl-c received, draining");
    shutdown.trigger();

    for daemon_id in registry.daemon_ids() {
        if let Some(handle) = registry.remove_daemon_channel(daemon_id) {
            handle.close("server shutting down");
        }
        if let Err(e) = store.mark_daemon_disconnected(daemon_id).await {
            tracing::warn!(%daemon_id, error = %e, "failed to mark daemon disconnected during shutdown");
        }
    }
    for pool_id in registry.pool_channel_ids() {
        if let Some(handle) = registry.remove_pool_channel(pool_id) {
            handle.close("server shutting down");
        }
    }
    for agent_id in registry.terminal_ids() {
        if let Some(handle) = registry.remove_terminal(agent_id) {
            handle.close("server shutting down");
        }
    }

    event_bus.shutdown();
    store.close().await;
    info!("drain complete");
}

fn shellexpand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}
