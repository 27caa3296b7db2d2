//! Error types for proxy pool operations

use thiserror::Error;

/// Errors from proxy pool operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no healthy proxy available, all {total} proxies are cooling down")]
    AllProxiesUnavailable { total: usize },

    #[error("invalid proxy spec: {0}")]
    InvalidProxySpec(String),

    #[error("proxy not found: {0}")]
    NotFound(String),
}

/// Result alias for proxy pool operations.
pub type Result<T> = std::result::Result<T, Error>;
