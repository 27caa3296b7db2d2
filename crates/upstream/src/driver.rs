//! The shared driver contract both `OAuthDriver` and `WebDriver` implement.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use account_registry::SelectedAccount;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::{Error, Result};

/// Per-request input a driver needs. Proxy/session are resolved by the
/// orchestrator before dispatch; the driver itself never selects them.
pub struct DriverRequest {
    /// Client request body, forwarded almost unchanged to the upstream
    /// endpoint. Drivers always set `"stream": true` on the outbound copy
    /// regardless of the client's own `stream` flag — buffering for a
    /// non-streaming response is the event pipeline's `NonStreamingEmitter`
    /// stage's job, so every driver call is uniformly a byte stream.
    pub body: serde_json::Value,
    pub account: SelectedAccount,
    /// Egress proxy URL, already resolved by the orchestrator (per-call for
    /// OAuth, captured-at-session-creation for Web).
    pub proxy_url: Option<String>,
    /// Present only on the Web path. `None` means a one-shot request: the
    /// driver creates and tears down its own conversation without touching
    /// the session manager.
    pub session: Option<SessionContext>,
}

/// Web-path session binding passed down from the orchestrator.
pub struct SessionContext {
    pub client_key: String,
    pub conversation_id: Option<String>,
    pub web_search_requested: bool,
}

/// What a driver call returns: the account that ultimately served the
/// request (useful when logging) and a raw byte stream of the upstream
/// HTTP response body, still in whatever SSE schema that driver speaks —
/// public for `OAuthDriver`, private for `WebDriver`. The `EventParser`
/// pipeline stage is what decodes and normalizes it.
pub struct DriverResponse {
    pub account_id: String,
    pub bytes: BoxStream<'static, reqwest::Result<Bytes>>,
}

/// Contract both drivers implement. Boxed-future return (rather than an
/// `async fn` in the trait) so the orchestrator can hold either driver
/// behind one `Arc<dyn Driver>`, matching the `ConversationCloser`
/// trait-object pattern used between `session-manager` and this crate.
pub trait Driver: Send + Sync {
    fn stream<'a>(
        &'a self,
        request: DriverRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DriverResponse>> + Send + 'a>>;
}

/// Shared HTTP-status classification used by both drivers to turn a
/// non-success upstream response into a typed, orchestrator-actionable
/// error. `proxied` distinguishes a 403 that should quarantine the proxy
/// from a 403 that should invalidate the account. `retry_after_ms`, when
/// the upstream supplied a `retry-after` header, overrides the fallback
/// 5-hour quota-window guess for `RateLimited.resets_at_ms`.
pub(crate) fn classify_response_error(
    status: u16,
    body: String,
    proxied: bool,
    retry_after_ms: Option<u64>,
) -> Error {
    use account_registry::Classification;
    match account_registry::classify_status(status, &body) {
        Classification::Permanent if status == 403 && proxied => Error::ProxyForbidden(body),
        Classification::Permanent => Error::InvalidCredentials(body),
        Classification::QuotaExceeded => {
            let fallback = Duration::from_secs(5 * 3600).as_millis() as u64;
            let resets_at_ms = account_registry::account::now_ms() + retry_after_ms.unwrap_or(fallback);
            Error::RateLimited { resets_at_ms, body }
        }
        Classification::Transient => Error::UpstreamStatus { status, body },
    }
}

/// Parse a `retry-after` header value (seconds, per RFC 9110) into millis.
pub(crate) fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|secs| secs * 1000)
}
