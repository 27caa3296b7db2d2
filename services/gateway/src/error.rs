//! Startup and wiring errors.
//!
//! Per-request errors are `orchestrator::OrchestratorError`, which already
//! implements `IntoResponse`; this type only covers config/credential/fleet
//! loading before the server starts accepting connections.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Auth(#[from] anthropic_auth::Error),

    #[error(transparent)]
    Registry(#[from] account_registry::Error),

    #[error(transparent)]
    Proxy(#[from] proxy_pool::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
