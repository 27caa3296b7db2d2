//! `OrchestratorError`: a tagged error result carrying `kind`, `retryable`,
//! and structured `context`, replacing exception-for-control-flow retry
//! dispatch with a value the orchestrator's retry loop matches on.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Kind {
    UpstreamOverloaded,
    RateLimited,
    InvalidCredentials,
    ProxyTransport,
    AllProxiesUnavailable,
    NoAccountsAvailable,
    UpstreamProtocol,
    ClientDisconnected,
    ValidationError,
}

impl Kind {
    /// Numeric code surfaced to clients/logs, per §7.
    pub fn code(self) -> u32 {
        match self {
            Kind::AllProxiesUnavailable => 503_200,
            Kind::ProxyTransport => 503_201,
            Kind::UpstreamOverloaded => 503_510,
            Kind::RateLimited => 503_520,
            Kind::InvalidCredentials => 503_530,
            Kind::NoAccountsAvailable => 503_540,
            Kind::UpstreamProtocol => 503_500,
            Kind::ClientDisconnected => 499_000,
            Kind::ValidationError => 400_000,
        }
    }

    pub fn http_status(self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Kind::ValidationError => StatusCode::BAD_REQUEST,
            Kind::ClientDisconnected => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct OrchestratorError {
    pub kind: Kind,
    pub retryable: bool,
    pub message: String,
    pub context: serde_json::Value,
}

impl OrchestratorError {
    pub fn new(kind: Kind, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable,
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn to_response_body(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "code": self.kind.code(),
                "type": format!("{:?}", self.kind),
                "message": self.message,
            }
        })
    }
}

impl axum::response::IntoResponse for OrchestratorError {
    fn into_response(self) -> axum::response::Response {
        (self.kind.http_status(), axum::Json(self.to_response_body())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Classify a pipeline-layer error into the orchestrator's retry taxonomy.
pub fn classify_pipeline_error(error: event_pipeline::Error) -> OrchestratorError {
    use upstream::Error as UpstreamError;

    match error {
        event_pipeline::Error::Overloaded => {
            OrchestratorError::new(Kind::UpstreamOverloaded, true, "upstream reported overload")
        }
        event_pipeline::Error::UpstreamProtocol(msg) => {
            OrchestratorError::new(Kind::UpstreamProtocol, false, msg)
        }
        event_pipeline::Error::Validation(msg) => OrchestratorError::new(Kind::ValidationError, false, msg),
        event_pipeline::Error::Driver(UpstreamError::RateLimited { resets_at_ms, body }) => {
            OrchestratorError::new(Kind::RateLimited, true, "rate limited")
                .with_context(serde_json::json!({"resets_at_ms": resets_at_ms, "body": body}))
        }
        event_pipeline::Error::Driver(UpstreamError::InvalidCredentials(msg)) => {
            OrchestratorError::new(Kind::InvalidCredentials, true, msg)
        }
        event_pipeline::Error::Driver(UpstreamError::ProxyForbidden(msg)) => {
            OrchestratorError::new(Kind::ProxyTransport, true, msg)
                .with_context(serde_json::json!({"cause": "http403"}))
        }
        event_pipeline::Error::Driver(UpstreamError::Transport(msg)) => {
            OrchestratorError::new(Kind::ProxyTransport, true, msg)
                .with_context(serde_json::json!({"cause": "transport"}))
        }
        event_pipeline::Error::Driver(UpstreamError::UpstreamStatus { status, body }) => {
            OrchestratorError::new(Kind::UpstreamProtocol, false, format!("status {status}: {body}"))
        }
        event_pipeline::Error::Driver(UpstreamError::ConversationCreate(msg)) => {
            OrchestratorError::new(Kind::ProxyTransport, true, msg)
        }
        event_pipeline::Error::Driver(UpstreamError::Session(e)) => {
            OrchestratorError::new(Kind::NoAccountsAvailable, true, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overloaded_classifies_as_retryable() {
        let err = classify_pipeline_error(event_pipeline::Error::Overloaded);
        assert_eq!(err.kind, Kind::UpstreamOverloaded);
        assert!(err.retryable);
        assert_eq!(err.kind.code(), 503_510);
    }

    #[test]
    fn upstream_protocol_is_not_retryable() {
        let err = classify_pipeline_error(event_pipeline::Error::UpstreamProtocol("bad frame".into()));
        assert!(!err.retryable);
    }

    #[test]
    fn rate_limited_carries_resets_at_in_context() {
        let err = classify_pipeline_error(event_pipeline::Error::Driver(upstream::Error::RateLimited {
            resets_at_ms: 12345,
            body: "quota".into(),
        }));
        assert_eq!(err.kind, Kind::RateLimited);
        assert_eq!(err.context["resets_at_ms"], 12345);
    }
}
