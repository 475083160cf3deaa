//! Relay gateway
//!
//! Single-binary service that:
//! 1. Authenticates client bearer tokens
//! 2. Picks a channel and key for the requested model
//! 3. Relays the request with retry/failover across channels
//! 4. Settles quota against actual usage and auto-disables failing channels

mod adapter_impl;
mod config;
mod metrics;
mod relay;
mod store;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::adapter_impl::OpenAiAdapter;
use crate::config::Config;
use crate::relay::AppState;
use crate::store::FileStore;
use dispatch::{
    spawn_cache_refresh, ChannelCache, ChannelHealthManager, ChannelSelector, MultiKeyRotator,
    QuotaAdmission, RetryCoordinator, StaticAdapterRegistry, Storage,
};

/// How long in-flight requests get to drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct RouterState {
    app: Arc<AppState>,
    prometheus: PrometheusHandle,
}

impl axum::extract::FromRef<RouterState> for Arc<AppState> {
    fn from_ref(state: &RouterState) -> Self {
        Arc::clone(&state.app)
    }
}

impl axum::extract::FromRef<RouterState> for PrometheusHandle {
    fn from_ref(state: &RouterState) -> Self {
        state.prometheus.clone()
    }
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: RouterState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(relay::chat_completions))
        .route("/v1/completions", post(relay::completions))
        .route("/v1/tasks", post(relay::tasks))
        .route("/health", get(relay::health))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting relay-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        state_path = %config.storage.state_path.display(),
        max_retries = config.dispatch.max_retries,
        tokens = config.tokens.len(),
        "configuration loaded"
    );

    let storage: Arc<dyn Storage> = Arc::new(
        FileStore::load(config.storage.state_path.clone(), config.error_log_path())
            .await
            .context("failed to load state file")?,
    );

    // Populate the cache once before serving, then refresh on an interval
    let cache = ChannelCache::new();
    let channels = storage
        .load_channels()
        .await
        .context("failed to load channels")?;
    info!(channels = channels.len(), "loaded channels");
    cache
        .replace(channels, !config.dispatch.persist_cursors)
        .await;
    let refresh_task = spawn_cache_refresh(
        cache.clone(),
        Arc::clone(&storage),
        Duration::from_secs(config.dispatch.cache_refresh_secs),
        !config.dispatch.persist_cursors,
    );

    let health_manager = ChannelHealthManager::spawn(
        cache.clone(),
        Arc::clone(&storage),
        config.dispatch.error_log_enabled,
        config.dispatch.health_queue_capacity,
    );

    let adapters = StaticAdapterRegistry::new().register(Arc::new(
        OpenAiAdapter::new(Duration::from_secs(config.server.timeout_secs))
            .context("failed to build upstream client")?,
    ));

    let coordinator = RetryCoordinator::new(
        ChannelSelector::new(cache.clone()),
        MultiKeyRotator::new(Arc::clone(&storage), config.dispatch.persist_cursors),
        QuotaAdmission::new(Arc::clone(&storage), config.price_table()),
        health_manager.handle(),
        Arc::new(adapters),
        config.dispatch.max_retries,
    );

    let tokens: HashMap<String, config::TokenConfig> = config
        .tokens
        .iter()
        .map(|t| (t.key.clone(), t.clone()))
        .collect();

    let app_state = Arc::new(AppState {
        coordinator,
        tokens,
        cache,
    });
    let router = build_router(
        RouterState {
            app: app_state,
            prometheus: prometheus_handle,
        },
        config.server.max_connections,
    );

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "accepting requests");

    // Graceful shutdown with drain timeout enforcement:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. axum stops accepting new connections and drains in-flight requests
    // 3. DRAIN_TIMEOUT caps how long a slow client can block process exit
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, &mut server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
            server_handle.abort();
        }
    }

    // Stop the refresh loop, then drain pending health reports so disable
    // decisions hit the state file before exit
    refresh_task.abort();
    health_manager.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(prometheus): State<PrometheusHandle>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
