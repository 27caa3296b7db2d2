//! Account Gateway
//!
//! Single-binary Rust service that exposes `POST /v1/messages` to clients
//! and serves completions from a fleet of Claude.ai accounts, picking
//! between an OAuth-authenticated path and a claude.ai web-session path per
//! request, with retry/failover across accounts and proxies.

mod admin;
mod config;
mod error;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use account_registry::Registry;
use anthropic_auth::CredentialStore;
use event_pipeline::Drivers;
use orchestrator::{Orchestrator, RetryPolicy};
use proxy_pool::Pool as ProxyPool;
use session_manager::SessionManager;
use upstream::{OAuthDriver, WebConversationCloser, WebDriver};

use crate::admin::AdminState;
use crate::config::Config;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    started_at: Instant,
    prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting account-gateway");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .with_context(|| format!("failed to create state dir {}", config.state_dir.display()))?;

    let prometheus_handle = metrics::install_recorder();

    let credentials = Arc::new(
        CredentialStore::load(config.credentials_path())
            .await
            .context("failed to load credential store")?,
    );

    let registry = Arc::new(
        Registry::load(config.accounts_path(), credentials.clone(), config.per_account_session_cap)
            .await
            .context("failed to load account registry")?,
    );

    let proxy_settings: proxy_pool::ProxySettings = config.proxy.clone().into();
    let proxy_list_text = match tokio::fs::read_to_string(config.proxies_path()).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).context("failed to read proxy list"),
    };
    let proxies_parsed = proxy_pool::proxy::parse_list(&proxy_list_text).context("failed to parse proxy list")?;
    let proxy_pool = Arc::new(ProxyPool::new(proxy_settings, proxies_parsed));

    let http_client = reqwest::Client::new();

    let web_closer = Arc::new(WebConversationCloser::new(http_client.clone(), registry.clone()));
    let sessions = Arc::new(SessionManager::new(
        registry.clone(),
        proxy_pool.clone(),
        Duration::from_secs(config.session_ttl_secs),
        web_closer,
    ));

    let drivers = Drivers {
        oauth: Arc::new(OAuthDriver::new(http_client.clone())),
        web: Arc::new(WebDriver::new(http_client.clone(), sessions.clone())),
    };

    let retry_policy = RetryPolicy {
        business_retry_attempts: config.retry_attempts,
        retry_interval: Duration::from_secs(config.retry_interval),
        overload_retry_attempts: config.overload_retry_attempts,
        overload_cooldown: Duration::from_secs(config.overload_cooldown),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        proxy_pool.clone(),
        sessions.clone(),
        drivers,
        retry_policy,
        config.max_concurrent_requests,
    ));

    account_registry::spawn_refresh_task(
        registry.clone(),
        Duration::from_secs(config.refresh_interval_secs),
        Duration::from_secs(config.refresh_threshold_secs),
    );
    proxy_pool::spawn_rotation_ticker(proxy_pool.clone(), Duration::from_secs(config.proxy.rotation_interval));

    let app_state = AppState { orchestrator, started_at: Instant::now(), prometheus_handle };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/v1/messages", post(messages_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(app_state);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");

    let admin_state = AdminState::new(registry.clone(), proxy_pool.clone(), http_client.clone());
    let admin_app = admin::build_admin_router(admin_state);
    let admin_listener = TcpListener::bind(config.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {}", config.admin_listen_addr))?;
    info!(addr = %config.admin_listen_addr, "admin API listening");

    let admin_server = axum::serve(admin_listener, admin_app).with_graceful_shutdown(shutdown_signal());
    let main_server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async { main_server.await.context("main server error") },
        async { admin_server.await.context("admin server error") },
    )?;

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: status and uptime. Does not exercise the account pool —
/// a heavier readiness check belongs in `/admin/accounts`.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let body = serde_json::json!({ "status": "healthy", "uptime_seconds": uptime });
    (axum::http::StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "application/json")], body.to_string())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, state.prometheus_handle.render())
}

/// `POST /v1/messages` — the public Anthropic Messages API surface.
async fn messages_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> axum::response::Response {
    let start = Instant::now();
    let method = "POST";

    match state.orchestrator.handle_messages(body).await {
        Ok(outcome) => {
            metrics::record_request(200, method, start.elapsed().as_secs_f64());
            outcome.response
        }
        Err(err) => {
            let status = err.kind.http_status().as_u16();
            metrics::record_request(status, method, start.elapsed().as_secs_f64());
            metrics::record_upstream_error(&format!("{:?}", err.kind));
            err.into_response()
        }
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
