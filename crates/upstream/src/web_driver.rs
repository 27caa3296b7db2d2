//! Web-path driver: emulates the claude.ai web UI via a three-step
//! create/send/delete conversation dance, all under one retry unit.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use session_manager::SessionManager;
use tracing::{debug, warn};

use crate::driver::{Driver, DriverRequest, DriverResponse, classify_response_error, parse_retry_after_ms};
use crate::error::{Error, Result};

const WEB_API_BASE: &str = "https://claude.ai/api";
const ANTHROPIC_CLIENT_PLATFORM: &str = "web_claude_ai";

fn create_url(account_id: &str) -> String {
    format!("{WEB_API_BASE}/organizations/{account_id}/chat_conversations")
}

fn send_url(account_id: &str, conversation_id: &str) -> String {
    format!("{WEB_API_BASE}/organizations/{account_id}/chat_conversations/{conversation_id}/completion")
}

fn delete_url(account_id: &str, conversation_id: &str) -> String {
    format!("{WEB_API_BASE}/organizations/{account_id}/chat_conversations/{conversation_id}")
}

pub struct WebDriver {
    client: reqwest::Client,
    sessions: Arc<SessionManager>,
}

impl WebDriver {
    pub fn new(client: reqwest::Client, sessions: Arc<SessionManager>) -> Self {
        Self { client, sessions }
    }

    fn build_client(&self, proxy_url: Option<&str>) -> Result<reqwest::Client> {
        match proxy_url {
            Some(url) => {
                let proxy = reqwest::Proxy::all(url)
                    .map_err(|e| Error::Transport(format!("invalid proxy url: {e}")))?;
                reqwest::Client::builder()
                    .proxy(proxy)
                    .build()
                    .map_err(|e| Error::Transport(format!("failed to build proxied client: {e}")))
            }
            None => Ok(self.client.clone()),
        }
    }

    async fn create_conversation(&self, client: &reqwest::Client, account_id: &str, cookie: &str) -> Result<String> {
        let response = client
            .post(create_url(account_id))
            .header(reqwest::header::COOKIE, cookie)
            .json(&serde_json::json!({ "uuid": uuid::Uuid::new_v4().to_string(), "name": "" }))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("conversation create failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ConversationCreate(format!("status {status}: {body}")));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::ConversationCreate(format!("invalid create response: {e}")))?;
        value
            .get("uuid")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| Error::ConversationCreate("create response missing uuid".into()))
    }

    async fn do_stream(&self, request: DriverRequest) -> Result<DriverResponse> {
        let DriverRequest {
            mut body,
            account,
            proxy_url,
            session,
        } = request;

        let cookie = account
            .cookie
            .clone()
            .ok_or_else(|| Error::InvalidCredentials("account has no web session cookie".into()))?;

        let web_search_requested = inject_web_search(&mut body);
        let client = self.build_client(proxy_url.as_deref())?;

        let (conversation_id, client_key) = match &session {
            Some(ctx) => {
                if web_search_requested && !ctx.web_search_requested {
                    if let Err(e) = self.sessions.set_web_search(&ctx.client_key, true).await {
                        warn!(client_key = %ctx.client_key, error = %e, "failed to persist web search flag");
                    }
                }
                let conversation_id = match &ctx.conversation_id {
                    Some(id) => id.clone(),
                    None => {
                        let id = self.create_conversation(&client, &account.id, &cookie).await?;
                        if let Err(e) = self
                            .sessions
                            .set_conversation_id(&ctx.client_key, id.clone())
                            .await
                        {
                            warn!(client_key = %ctx.client_key, error = %e, "failed to persist conversation id");
                        }
                        id
                    }
                };
                (conversation_id, Some(ctx.client_key.clone()))
            }
            None => {
                let id = self.create_conversation(&client, &account.id, &cookie).await?;
                (id, None)
            }
        };

        body["stream"] = serde_json::Value::Bool(true);

        let response = client
            .post(send_url(&account.id, &conversation_id))
            .header(reqwest::header::COOKIE, &cookie)
            .header("anthropic-client-platform", ANTHROPIC_CLIENT_PLATFORM)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("conversation send failed: {e}")));

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.delete_best_effort(&client, &account.id, &conversation_id, &cookie, client_key.as_deref())
                    .await;
                return Err(e);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = parse_retry_after_ms(response.headers());
            let body_text = response.text().await.unwrap_or_default();
            self.delete_best_effort(&client, &account.id, &conversation_id, &cookie, client_key.as_deref())
                .await;
            return Err(classify_response_error(
                status.as_u16(),
                body_text,
                proxy_url.is_some(),
                retry_after_ms,
            ));
        }

        // One-shot requests tear down their conversation immediately after
        // a successful send — there is no session to keep it bound to.
        if client_key.is_none() {
            self.delete_best_effort(&client, &account.id, &conversation_id, &cookie, None)
                .await;
        }

        debug!(account_id = %account.id, conversation_id, "web driver stream established");
        Ok(DriverResponse {
            account_id: account.id,
            bytes: Box::pin(response.bytes_stream()),
        })
    }

    async fn delete_best_effort(
        &self,
        client: &reqwest::Client,
        account_id: &str,
        conversation_id: &str,
        cookie: &str,
        client_key: Option<&str>,
    ) {
        let result = client
            .delete(delete_url(account_id, conversation_id))
            .header(reqwest::header::COOKIE, cookie)
            .send()
            .await;
        match result {
            Ok(r) if r.status().is_success() => {
                debug!(account_id, conversation_id, "conversation deleted");
            }
            Ok(r) => warn!(account_id, conversation_id, status = %r.status(), "conversation delete returned non-success"),
            Err(e) => warn!(account_id, conversation_id, error = %e, "conversation delete failed"),
        }
        let _ = client_key;
    }
}

impl Driver for WebDriver {
    fn stream<'a>(
        &'a self,
        request: DriverRequest,
    ) -> Pin<Box<dyn Future<Output = Result<DriverResponse>> + Send + 'a>> {
        Box::pin(self.do_stream(request))
    }
}

/// If the client requested the public `web_search_*` tool, strip it and
/// inject the private `web_search_v0` variant the web endpoint expects.
/// Both the injected tool and the upstream conversation's search setting
/// (handled by the caller via `SessionManager::set_web_search`) are
/// required to actually trigger search.
fn inject_web_search(body: &mut Value) -> bool {
    let Some(tools) = body.get_mut("tools").and_then(|t| t.as_array_mut()) else {
        return false;
    };

    let mut found = false;
    for tool in tools.iter_mut() {
        let is_web_search = tool
            .get("type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| t.starts_with("web_search_"));
        if is_web_search {
            found = true;
            *tool = serde_json::json!({ "type": "web_search_v0", "name": "web_search" });
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_web_search_replaces_public_variant() {
        let mut body = serde_json::json!({
            "tools": [{"type": "web_search_20250305", "name": "web_search"}]
        });
        let found = inject_web_search(&mut body);
        assert!(found);
        assert_eq!(body["tools"][0]["type"], "web_search_v0");
    }

    #[test]
    fn inject_web_search_noop_without_tools() {
        let mut body = serde_json::json!({ "messages": [] });
        assert!(!inject_web_search(&mut body));
    }

    #[test]
    fn inject_web_search_leaves_other_tools_untouched() {
        let mut body = serde_json::json!({
            "tools": [{"type": "custom_tool", "name": "my_tool"}]
        });
        assert!(!inject_web_search(&mut body));
        assert_eq!(body["tools"][0]["type"], "custom_tool");
    }

    #[test]
    fn create_url_uses_account_id_as_org_id() {
        assert_eq!(
            create_url("org-123"),
            "https://claude.ai/api/organizations/org-123/chat_conversations"
        );
    }

    #[test]
    fn send_and_delete_urls_include_conversation_id() {
        assert_eq!(
            send_url("org-123", "conv-1"),
            "https://claude.ai/api/organizations/org-123/chat_conversations/conv-1/completion"
        );
        assert_eq!(
            delete_url("org-123", "conv-1"),
            "https://claude.ai/api/organizations/org-123/chat_conversations/conv-1"
        );
    }
}
