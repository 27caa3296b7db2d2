//! Error types for account registry operations

/// Errors from account registry operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no account available for this request kind")]
    NoAccountsAvailable,

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("credential error: {0}")]
    Credential(#[from] anthropic_auth::Error),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("fleet file parse error: {0}")]
    Parse(String),
}

/// Result alias for account registry operations.
pub type Result<T> = std::result::Result<T, Error>;
