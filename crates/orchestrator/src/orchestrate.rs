//! The `Orchestrator`: account/proxy/session selection plus the §4.6
//! retry/failover loop. This is the one place in the repository that
//! combines the account registry, proxy pool, session manager, and event
//! pipeline into a single per-request flow.

use std::sync::Arc;
use std::time::Duration;

use account_registry::Registry;
use event_pipeline::{Drivers, PipelineOutcome};
use proxy_pool::{FailureCause, Pool as ProxyPool};
use serde_json::Value;
use session_manager::SessionManager;
use tokio::sync::Semaphore;
use tracing::warn;
use upstream::SessionContext;

use crate::client_key;
use crate::error::{Kind, OrchestratorError, Result, classify_pipeline_error as classify};

/// Wait policies and attempt caps per §4.6. Two independent counters:
/// overload backoff (exponential, its own cap) and every other retryable
/// business error (fixed interval, its own cap).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub business_retry_attempts: u32,
    pub retry_interval: Duration,
    pub overload_retry_attempts: u32,
    pub overload_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            business_retry_attempts: 3,
            retry_interval: Duration::from_secs(1),
            overload_retry_attempts: 5,
            overload_cooldown: Duration::from_secs(30),
        }
    }
}

fn overload_backoff(attempt: u32) -> Duration {
    let capped_exponent = attempt.min(5);
    Duration::from_secs(2u64.saturating_pow(capped_exponent)).min(Duration::from_secs(30))
}

/// One account/proxy/session pick for a single attempt.
struct Selection {
    account: account_registry::SelectedAccount,
    proxy_url: Option<String>,
    proxy_key: Option<String>,
    session: Option<SessionContext>,
    client_key: Option<String>,
}

pub struct Orchestrator {
    accounts: Arc<Registry>,
    proxies: Arc<ProxyPool>,
    sessions: Arc<SessionManager>,
    drivers: Drivers,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        accounts: Arc<Registry>,
        proxies: Arc<ProxyPool>,
        sessions: Arc<SessionManager>,
        drivers: Drivers,
        retry: RetryPolicy,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            accounts,
            proxies,
            sessions,
            drivers,
            retry,
            semaphore: Arc::new(Semaphore::new(max_concurrent_requests)),
        }
    }

    /// Run one client request to completion: validate, select, drive the
    /// pipeline, and retry/fail over per §4.6 until a response is produced
    /// or the retry budget is exhausted.
    pub async fn handle_messages(&self, body: Value) -> Result<PipelineOutcome> {
        validate(&body)?;

        // A request over `max_concurrent_requests` queues here rather than
        // being rejected — the semaphore permit acquisition itself is the
        // queue.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        let client_key = client_key::derive(&body);
        let wants_session = wants_web_search(&body);

        let mut business_attempts: u32 = 0;
        let mut overload_attempts: u32 = 0;

        loop {
            let selection = self.select(wants_session, &client_key).await?;
            let account_id = selection.account.id.clone();
            let proxy_key = selection.proxy_key.clone();
            let attempt_client_key = selection.client_key.clone();

            let outcome = event_pipeline::run(
                body.clone(),
                selection.account,
                selection.proxy_url,
                selection.session,
                &self.drivers,
            )
            .await;

            let pipeline_err = match outcome {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };

            let err = classify(pipeline_err);
            self.record_failure(&err, &account_id, &proxy_key, &attempt_client_key)
                .await;

            if !err.retryable {
                self.finalize_failure(&attempt_client_key).await;
                return Err(err);
            }

            let wait = match err.kind {
                Kind::UpstreamOverloaded => {
                    overload_attempts += 1;
                    if overload_attempts > self.retry.overload_retry_attempts {
                        self.finalize_failure(&attempt_client_key).await;
                        return Err(err);
                    }
                    Some(overload_backoff(overload_attempts))
                }
                Kind::RateLimited => {
                    business_attempts += 1;
                    if business_attempts > self.retry.business_retry_attempts {
                        self.finalize_failure(&attempt_client_key).await;
                        return Err(err);
                    }
                    // Retry immediately with a different account.
                    None
                }
                _ => {
                    business_attempts += 1;
                    if business_attempts > self.retry.business_retry_attempts {
                        self.finalize_failure(&attempt_client_key).await;
                        return Err(err);
                    }
                    Some(self.retry.retry_interval)
                }
            };

            metrics::counter!("gateway_retries_total", "kind" => retry_kind_label(err.kind)).increment(1);

            if let Some(wait) = wait {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Requests with an explicit `web_search_*` tool must go through the
    /// Session Manager: only a session carries the server-side conversation
    /// `setWebSearch` flag the Web driver needs to actually enable search.
    /// Plain requests prefer the stateless OAuth path and fall back to a
    /// Web session only when no OAuth-capable account is available.
    async fn select(&self, wants_session: bool, client_key: &str) -> Result<Selection> {
        if wants_session {
            return self.select_session(client_key).await;
        }

        match self.accounts.pick_for_oauth().await {
            Ok(account) => self.attach_proxy(account, None).await,
            Err(account_registry::Error::NoAccountsAvailable) => self.select_session(client_key).await,
            Err(e) => Err(no_accounts_error(e)),
        }
    }

    async fn attach_proxy(
        &self,
        account: account_registry::SelectedAccount,
        client_key: Option<&str>,
    ) -> Result<Selection> {
        let proxy = self
            .proxies
            .get_proxy(Some(&account.id))
            .await
            .map_err(proxy_error)?;
        let proxy_url = proxy.as_ref().map(|p| p.connect_url());
        let proxy_key = proxy.as_ref().map(|p| p.key());
        Ok(Selection {
            account,
            proxy_url,
            proxy_key,
            session: None,
            client_key: client_key.map(String::from),
        })
    }

    async fn select_session(&self, client_key: &str) -> Result<Selection> {
        let session = self
            .sessions
            .get_or_create(client_key)
            .await
            .map_err(session_error)?;
        let account = self
            .accounts
            .account_for_session(&session.account_id)
            .await
            .map_err(no_accounts_error)?;
        let proxy_key = session
            .proxy_url
            .as_deref()
            .and_then(|url| proxy_pool::proxy::parse(url).ok())
            .map(|p| p.key());
        Ok(Selection {
            account,
            proxy_url: session.proxy_url.clone(),
            proxy_key,
            session: Some(SessionContext {
                client_key: client_key.to_string(),
                conversation_id: session.conversation_id.clone(),
                web_search_requested: session.web_search_enabled,
            }),
            client_key: Some(client_key.to_string()),
        })
    }

    /// Apply the health-state side effect for one failed attempt (§4.6):
    /// mark the account or proxy, so the *next* selection avoids it.
    async fn record_failure(
        &self,
        err: &OrchestratorError,
        account_id: &str,
        proxy_key: &Option<String>,
        client_key: &Option<String>,
    ) {
        match err.kind {
            Kind::UpstreamOverloaded => {
                if let Err(e) = self
                    .accounts
                    .mark_overloaded(account_id, self.retry.overload_cooldown)
                    .await
                {
                    warn!(account_id, error = %e, "failed to record overload cooldown");
                }
            }
            Kind::RateLimited => {
                if let Some(resets_at_ms) = err.context.get("resets_at_ms").and_then(|v| v.as_u64())
                    && let Err(e) = self.accounts.mark_rate_limited(account_id, resets_at_ms).await
                {
                    warn!(account_id, error = %e, "failed to record rate limit");
                }
            }
            Kind::InvalidCredentials => {
                if let Err(e) = self.accounts.mark_invalid(account_id).await {
                    warn!(account_id, error = %e, "failed to mark account invalid");
                }
                if let Some(key) = client_key {
                    self.destroy_session(key).await;
                }
            }
            Kind::ProxyTransport => {
                if let Some(key) = proxy_key {
                    let cause = match err.context.get("cause").and_then(|v| v.as_str()) {
                        Some("http403") => FailureCause::Http403,
                        _ => FailureCause::Transport,
                    };
                    self.proxies.report_failure(key, cause).await;
                }
            }
            _ => {}
        }
    }

    /// Final cleanup once the retry budget is spent or the error was never
    /// retryable to begin with: the session (if any) tied to this attempt
    /// is destroyed so a future call with the same client key binds fresh.
    async fn finalize_failure(&self, client_key: &Option<String>) {
        if let Some(key) = client_key {
            self.destroy_session(key).await;
        }
    }

    async fn destroy_session(&self, client_key: &str) {
        if let Err(e) = self.sessions.destroy(client_key, "terminal error").await {
            warn!(client_key, error = %e, "failed to destroy session on terminal failure");
        }
    }
}

/// Label for the `gateway_retries_total` counter (the metric name itself
/// lives in the gateway binary, but emission happens here at the point the
/// retry decision is made).
fn retry_kind_label(kind: Kind) -> &'static str {
    match kind {
        Kind::UpstreamOverloaded => "overload",
        Kind::RateLimited => "rate_limited",
        _ => "standard",
    }
}

fn no_accounts_error(e: account_registry::Error) -> OrchestratorError {
    OrchestratorError::new(Kind::NoAccountsAvailable, false, e.to_string())
}

fn proxy_error(e: proxy_pool::Error) -> OrchestratorError {
    OrchestratorError::new(Kind::AllProxiesUnavailable, true, e.to_string())
}

fn session_error(e: session_manager::Error) -> OrchestratorError {
    OrchestratorError::new(Kind::NoAccountsAvailable, false, e.to_string())
}

/// A request that asks for the public `web_search_*` tool can only be
/// served on the Web path's session, because enabling search requires the
/// session-bound `setWebSearch` call against the upstream conversation.
fn wants_web_search(body: &Value) -> bool {
    body.get("tools")
        .and_then(|t| t.as_array())
        .is_some_and(|tools| {
            tools.iter().any(|tool| {
                tool.get("type")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| t.starts_with("web_search_"))
            })
        })
}

fn validate(body: &Value) -> Result<()> {
    let model_is_empty = body
        .get("model")
        .and_then(|v| v.as_str())
        .map(|m| m.is_empty())
        .unwrap_or(true);
    if model_is_empty {
        return Err(OrchestratorError::new(
            Kind::ValidationError,
            false,
            "request missing required field: model",
        ));
    }

    let messages_empty = body
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|m| m.is_empty())
        .unwrap_or(true);
    if messages_empty {
        return Err(OrchestratorError::new(
            Kind::ValidationError,
            false,
            "request missing required non-empty field: messages",
        ));
    }

    if body.get("max_tokens").and_then(|v| v.as_u64()).is_none() {
        return Err(OrchestratorError::new(
            Kind::ValidationError,
            false,
            "request missing required field: max_tokens",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_kind_label_maps_overload_and_rate_limit_distinctly() {
        assert_eq!(retry_kind_label(Kind::UpstreamOverloaded), "overload");
        assert_eq!(retry_kind_label(Kind::RateLimited), "rate_limited");
        assert_eq!(retry_kind_label(Kind::ProxyTransport), "standard");
        assert_eq!(retry_kind_label(Kind::UpstreamProtocol), "standard");
    }

    #[test]
    fn overload_backoff_caps_at_thirty_seconds() {
        assert_eq!(overload_backoff(1), Duration::from_secs(2));
        assert_eq!(overload_backoff(4), Duration::from_secs(16));
        assert_eq!(overload_backoff(5), Duration::from_secs(30));
        assert_eq!(overload_backoff(9), Duration::from_secs(30));
    }

    #[test]
    fn wants_web_search_detects_public_tool_name() {
        let body = serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "web_search_20250305", "name": "web_search"}]
        });
        assert!(wants_web_search(&body));
    }

    #[test]
    fn wants_web_search_false_without_tools() {
        let body = serde_json::json!({"model": "m", "messages": []});
        assert!(!wants_web_search(&body));
    }

    #[test]
    fn validate_rejects_missing_model() {
        let body = serde_json::json!({"messages": [{"role": "user", "content": "hi"}], "max_tokens": 1});
        let err = validate(&body).unwrap_err();
        assert_eq!(err.kind, Kind::ValidationError);
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let body = serde_json::json!({"model": "m", "messages": [], "max_tokens": 1});
        assert!(validate(&body).is_err());
    }

    #[test]
    fn validate_rejects_missing_max_tokens() {
        let body = serde_json::json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        assert!(validate(&body).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_request() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1024,
        });
        assert!(validate(&body).is_ok());
    }
}
