//! The `Session` type: account-bound, client-keyed web state.

use std::time::{Duration, Instant};

/// Per-`(account, clientKey)` web session.
///
/// The proxy is captured once at creation (not re-picked per call) so a
/// conversation's traffic stays on one egress for its whole lifetime, which
/// matters for the Web path's conversation continuity. The OAuth path never
/// constructs one of these — it picks a proxy per call instead.
#[derive(Debug, Clone)]
pub struct Session {
    pub account_id: String,
    pub client_key: String,
    pub proxy_url: Option<String>,
    pub conversation_id: Option<String>,
    pub web_search_enabled: bool,
    pub paprika_mode: bool,
    created_at: Instant,
    ttl: Duration,
}

impl Session {
    pub fn new(account_id: String, client_key: String, proxy_url: Option<String>, ttl: Duration) -> Self {
        Self {
            account_id,
            client_key,
            proxy_url,
            conversation_id: None,
            web_search_enabled: false,
            paprika_mode: false,
            created_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}
