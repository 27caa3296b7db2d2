//! Account type: capability flags, tier, status, and the fields the
//! selection and health-probe logic reason about.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Subscription tier, informational today but part of the data model so
/// future selection policies (e.g. prefer `max` for large requests) have
/// somewhere to read it from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Max,
}

/// Runtime status of an account.
///
/// Transitions: `Valid -> Invalid` (permanent auth failure), `Valid ->
/// RateLimited` (HTTP 429), `RateLimited -> Valid` (resets_at elapsed, or
/// an explicit probe confirms availability). `Invalid` is only cleared by
/// an explicit `refresh` that re-validates credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Status {
    Valid,
    Invalid,
    RateLimited { resets_at_ms: u64 },
}

impl Status {
    pub fn label(&self) -> &'static str {
        match self {
            Status::Valid => "valid",
            Status::Invalid => "invalid",
            Status::RateLimited { .. } => "rate_limited",
        }
    }
}

/// Fleet metadata for one account, persisted to `accounts.json`. The
/// credential bundle itself (access/refresh token, cookie) lives in
/// `anthropic_auth::CredentialStore`, keyed by the same account id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountMeta {
    pub can_oauth: bool,
    pub can_web: bool,
    pub tier: Tier,
    pub status: Status,
    #[serde(default)]
    pub overloaded_until_ms: Option<u64>,
    #[serde(default)]
    pub session_count: u32,
    #[serde(default = "now_ms")]
    pub last_used_ms: u64,
}

impl AccountMeta {
    pub fn new(can_oauth: bool, can_web: bool, tier: Tier) -> Self {
        Self {
            can_oauth,
            can_web,
            tier,
            status: Status::Valid,
            overloaded_until_ms: None,
            session_count: 0,
            last_used_ms: now_ms(),
        }
    }

    pub fn is_overloaded(&self, now_ms: u64) -> bool {
        self.overloaded_until_ms.is_some_and(|until| until > now_ms)
    }

    /// `RATE_LIMITED` accounts transition back to usable once their
    /// `resetsAt` has passed — observed on read, no background sweeper.
    pub fn is_selectable_status(&self, now_ms: u64) -> bool {
        match self.status {
            Status::Valid => true,
            Status::Invalid => false,
            Status::RateLimited { resets_at_ms } => resets_at_ms <= now_ms,
        }
    }
}

/// A full account view returned to callers (admin listing, selection
/// results). Never carries raw token material — just enough to log and to
/// drive a request.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub can_oauth: bool,
    pub can_web: bool,
    pub tier: Tier,
    pub status: Status,
    pub session_count: u32,
    pub last_used_ms: u64,
    pub has_cookie: bool,
}

/// An account selected to serve one request, with the material a driver
/// needs and nothing more.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub id: String,
    pub access_token: Option<String>,
    pub cookie: Option<String>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
