//! OAuth-authenticated driver: forwards the client request almost
//! unchanged to the public inference endpoint with the account's Bearer
//! token, merging beta headers and injecting the required system-prompt
//! prefix, and attaching a resolved proxy when one is selected.

use std::future::Future;
use std::pin::Pin;

use anthropic_auth::REQUIRED_SYSTEM_PROMPT_PREFIX;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::driver::{Driver, DriverRequest, DriverResponse, classify_response_error, parse_retry_after_ms};
use crate::error::{Error, Result};

const MESSAGES_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

/// Required anthropic-beta flags for OAuth mode, always injected and
/// merged with any client-provided beta flags (deduplicated).
const REQUIRED_BETA_FLAGS: &[&str] = &[
    "oauth-2025-04-20",
    "interleaved-thinking-2025-05-14",
    "context-management-2025-06-27",
];

const USER_AGENT: &str = "claude-cli/2.0.76 (external, sdk-cli)";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct OAuthDriver {
    client: reqwest::Client,
}

impl OAuthDriver {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn do_stream(&self, request: DriverRequest) -> Result<DriverResponse> {
        let DriverRequest {
            mut body,
            account,
            proxy_url,
            ..
        } = request;

        let access_token = account
            .access_token
            .as_deref()
            .ok_or_else(|| Error::InvalidCredentials("account has no OAuth access token".into()))?;

        let beta_flags = body.get("anthropic-beta").cloned();
        let headers = build_headers(access_token, beta_flags.as_ref())
            .map_err(|e| Error::InvalidCredentials(format!("invalid token value: {e}")))?;

        inject_system_prompt(&mut body);
        // Always stream upstream; the client's own `stream` flag is honored
        // only by the pipeline's terminal emitter stage.
        body["stream"] = serde_json::Value::Bool(true);

        let proxied_client;
        let client = match &proxy_url {
            Some(url) => {
                let proxy = reqwest::Proxy::all(url)
                    .map_err(|e| Error::Transport(format!("invalid proxy url: {e}")))?;
                proxied_client = reqwest::Client::builder()
                    .proxy(proxy)
                    .build()
                    .map_err(|e| Error::Transport(format!("failed to build proxied client: {e}")))?;
                &proxied_client
            }
            None => &self.client,
        };

        let response = client
            .post(MESSAGES_ENDPOINT)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("oauth request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = parse_retry_after_ms(response.headers());
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_response_error(
                status.as_u16(),
                body_text,
                proxy_url.is_some(),
                retry_after_ms,
            ));
        }

        debug!(account_id = %account.id, "oauth driver stream established");
        let bytes = response.bytes_stream();
        Ok(DriverResponse {
            account_id: account.id,
            bytes: Box::pin(bytes),
        })
    }
}

fn build_headers(
    access_token: &str,
    client_beta_flags: Option<&serde_json::Value>,
) -> std::result::Result<HeaderMap, reqwest::header::InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {access_token}"))?,
    );
    merge_beta_headers(&mut headers, client_beta_flags);
    headers.insert(
        HeaderName::from_static("anthropic-dangerous-direct-browser-access"),
        HeaderValue::from_static("true"),
    );
    headers.insert(reqwest::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    headers.insert(
        HeaderName::from_static("anthropic-version"),
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );
    Ok(headers)
}

impl Driver for OAuthDriver {
    fn stream<'a>(
        &'a self,
        request: DriverRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DriverResponse>> + Send + 'a>> {
        Box::pin(self.do_stream(request))
    }
}

/// Merge required anthropic-beta flags with any client-provided flags.
fn merge_beta_headers(headers: &mut HeaderMap, client_flags: Option<&serde_json::Value>) {
    let mut flags: Vec<String> = REQUIRED_BETA_FLAGS.iter().map(|s| s.to_string()).collect();

    if let Some(existing) = client_flags.and_then(|v| v.as_str()) {
        for flag in existing.split(',') {
            let trimmed = flag.trim().to_string();
            if !trimmed.is_empty() && !flags.contains(&trimmed) {
                flags.push(trimmed);
            }
        }
    }

    let merged = flags.join(",");
    if let Ok(v) = HeaderValue::from_str(&merged) {
        headers.insert(HeaderName::from_static("anthropic-beta"), v);
    }
}

fn extract_model(body: &serde_json::Value) -> Option<&str> {
    body.get("model").and_then(|m| m.as_str())
}

/// Inject the required system prompt prefix for non-Haiku models.
fn inject_system_prompt(body: &mut serde_json::Value) {
    let model = match extract_model(body) {
        Some(m) => m.to_lowercase(),
        None => return,
    };

    if model.contains("haiku") {
        return;
    }

    match body.get("system") {
        None => {
            body["system"] = serde_json::Value::String(REQUIRED_SYSTEM_PROMPT_PREFIX.to_string());
        }
        Some(existing) => {
            if let Some(existing_str) = existing.as_str()
                && !existing_str.starts_with(REQUIRED_SYSTEM_PROMPT_PREFIX)
            {
                body["system"] =
                    serde_json::Value::String(format!("{REQUIRED_SYSTEM_PROMPT_PREFIX} {existing_str}"));
            }
        }
    }
}
