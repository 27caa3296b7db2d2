//! Error types for session manager operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("account registry error: {0}")]
    Registry(#[from] account_registry::Error),

    #[error("session not found for client key: {0}")]
    NotFound(String),

    #[error("invalid proxy configuration: {0}")]
    Proxy(String),
}

pub type Result<T> = std::result::Result<T, Error>;
