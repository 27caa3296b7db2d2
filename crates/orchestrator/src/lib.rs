//! Request Orchestrator: the top entrypoint that chooses a driver, borrows
//! an account + proxy + session, runs the event pipeline, and owns the
//! retry/failover policy across accounts and proxies.

pub mod client_key;
pub mod error;
pub mod orchestrate;

pub use error::{Kind, OrchestratorError, Result, classify_pipeline_error};
pub use orchestrate::{Orchestrator, RetryPolicy};
