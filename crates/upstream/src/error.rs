//! Error types for upstream driver operations.
//!
//! These are HTTP/transport-level classifications the drivers can make
//! directly from a response's status and body. Content-level signals (an
//! `overloaded_error` event inside an otherwise-200 SSE stream) are the
//! event pipeline's `OverloadDetector` stage's job, not the driver's.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid credentials (401/403, no proxy involved): {0}")]
    InvalidCredentials(String),

    #[error("forbidden while proxied (403): {0}")]
    ProxyForbidden(String),

    #[error("rate limited (429), resets at {resets_at_ms}: {body}")]
    RateLimited { resets_at_ms: u64, body: String },

    #[error("upstream returned unexpected status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("session error: {0}")]
    Session(#[from] session_manager::Error),

    #[error("conversation create failed: {0}")]
    ConversationCreate(String),
}

pub type Result<T> = std::result::Result<T, Error>;
