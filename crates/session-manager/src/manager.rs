//! `SessionManager`: lazily-created, TTL-expiring web sessions bound to a
//! `(account, clientKey)` pair, backed by the account registry for account
//! selection and session-count bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use account_registry::Registry;
use proxy_pool::Pool as ProxyPool;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::closer::ConversationCloser;
use crate::error::{Error, Result};
use crate::session::Session;

/// Owns the `clientKey -> Session` map: an in-memory `HashMap` behind a
/// `tokio::sync::Mutex` with lazy expiry-sweep-on-insert (no background
/// reaper task).
pub struct SessionManager {
    registry: Arc<Registry>,
    proxy_pool: Arc<ProxyPool>,
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
    closer: Arc<dyn ConversationCloser>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<Registry>,
        proxy_pool: Arc<ProxyPool>,
        ttl: Duration,
        closer: Arc<dyn ConversationCloser>,
    ) -> Self {
        Self {
            registry,
            proxy_pool,
            sessions: Mutex::new(HashMap::new()),
            ttl,
            closer,
        }
    }

    /// `getOrCreate`: return the live session for `clientKey`, sweeping it
    /// out first if its TTL has elapsed, or bind a fresh account and proxy
    /// and create one.
    pub async fn get_or_create(&self, client_key: &str) -> Result<Session> {
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(client_key) {
            if !existing.is_expired() {
                return Ok(existing.clone());
            }
            let expired = sessions.remove(client_key).unwrap();
            drop(sessions);
            self.expire_session(expired).await;
            sessions = self.sessions.lock().await;
        }

        let selected = self.registry.pick_for_session(client_key).await?;
        let proxy_url = match self.proxy_pool.get_proxy(Some(&selected.id)).await {
            Ok(Some(proxy)) => Some(proxy.connect_url()),
            Ok(None) => None,
            Err(e) => {
                warn!(account_id = %selected.id, error = %e, "proxy pool unavailable for new session");
                return Err(Error::Proxy(e.to_string()));
            }
        };

        let session = Session::new(selected.id.clone(), client_key.to_string(), proxy_url, self.ttl);
        sessions.insert(client_key.to_string(), session.clone());
        debug!(client_key, account_id = %selected.id, "session created");
        Ok(session)
    }

    /// Record the server-side conversation id created for this session's
    /// first Web-path turn.
    pub async fn set_conversation_id(&self, client_key: &str, conversation_id: String) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(client_key)
            .ok_or_else(|| Error::NotFound(client_key.to_string()))?;
        session.conversation_id = Some(conversation_id);
        Ok(())
    }

    pub async fn set_web_search(&self, client_key: &str, enabled: bool) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(client_key)
            .ok_or_else(|| Error::NotFound(client_key.to_string()))?;
        session.web_search_enabled = enabled;
        Ok(())
    }

    pub async fn set_thinking(&self, client_key: &str, enabled: bool) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(client_key)
            .ok_or_else(|| Error::NotFound(client_key.to_string()))?;
        session.paprika_mode = enabled;
        Ok(())
    }

    /// Explicit destroy after a terminal, non-retryable error: best-effort
    /// conversation deletion, then drop the session and release its slot.
    pub async fn destroy(&self, client_key: &str, reason: &str) -> Result<()> {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(client_key)
        };
        let Some(session) = removed else {
            return Ok(());
        };
        debug!(client_key, reason, "destroying session");
        self.expire_session(session).await;
        Ok(())
    }

    async fn expire_session(&self, session: Session) {
        if let Some(conversation_id) = &session.conversation_id {
            self.closer.close(&session.account_id, conversation_id).await;
        }
        if let Err(e) = self.registry.unbind_session(&session.account_id).await {
            warn!(account_id = %session.account_id, error = %e, "failed to unbind session from registry");
        }
    }
}
