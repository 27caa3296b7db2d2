//! Pipeline-local error kinds. These are the ones the orchestrator sees
//! bubble up from a single pipeline run; transport/account-state errors
//! from the driver are wrapped, not duplicated here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Driver(#[from] upstream::Error),

    /// Upstream reported overload before any response bytes were sent to
    /// the client — the `OverloadDetector` stage's only job.
    #[error("upstream overloaded")]
    Overloaded,

    /// A raw upstream frame could not be decoded into any known event.
    #[error("malformed upstream event: {0}")]
    UpstreamProtocol(String),

    #[error("client request was malformed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
