//! `ConversationCloser` implementation backing the Web driver's best-effort
//! delete. Lives here rather than in `session-manager` to keep the
//! dependency edge one-directional (`upstream` depends on
//! `session-manager`, never the reverse).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use account_registry::Registry;
use session_manager::ConversationCloser;
use tracing::warn;

fn delete_url(account_id: &str, conversation_id: &str) -> String {
    format!("https://claude.ai/api/organizations/{account_id}/chat_conversations/{conversation_id}")
}

pub struct WebConversationCloser {
    client: reqwest::Client,
    registry: Arc<Registry>,
}

impl WebConversationCloser {
    pub fn new(client: reqwest::Client, registry: Arc<Registry>) -> Self {
        Self { client, registry }
    }

    async fn do_close(&self, account_id: &str, conversation_id: &str) {
        let Some(credential) = self.registry.credential_store().get(account_id).await else {
            warn!(account_id, "no stored credential to close conversation with");
            return;
        };
        let Some(cookie) = credential.cookie else {
            warn!(account_id, "account has no web session cookie, cannot close conversation");
            return;
        };

        let result = self
            .client
            .delete(delete_url(account_id, conversation_id))
            .header(reqwest::header::COOKIE, cookie)
            .send()
            .await;

        match result {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => warn!(account_id, conversation_id, status = %r.status(), "session close returned non-success"),
            Err(e) => warn!(account_id, conversation_id, error = %e, "session close failed"),
        }
    }
}

impl ConversationCloser for WebConversationCloser {
    fn close<'a>(
        &'a self,
        account_id: &'a str,
        conversation_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.do_close(account_id, conversation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_url_matches_web_driver_format() {
        assert_eq!(
            delete_url("org-1", "conv-1"),
            "https://claude.ai/api/organizations/org-1/chat_conversations/conv-1"
        );
    }
}
