//! Proactive background token refresh and the two-phase health probe.
//!
//! Two independent concerns share one background task:
//! 1. Proactive token refresh — accounts whose access token is close to
//!    expiry get refreshed before the request path would hit a 401.
//! 2. Health probing — `RATE_LIMITED` accounts are periodically re-checked
//!    so they rejoin the selectable pool as soon as their window resets,
//!    rather than waiting on `resetsAt` alone.
//!
//! Phase 1 of the probe is a cheap read-only profile call; Phase 2 (a
//! minimal chat request) only runs for accounts Phase 1 reports valid,
//! since a quota-exhausted account will fail Phase 2 identically to
//! Phase 1 but at higher cost to the account's remaining quota.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::account::{Status, now_ms};
use crate::error::Result;
use crate::quota::{self, Classification};
use crate::registry::Registry;

/// Read-only endpoint used for the Phase 1 probe. Any authenticated,
/// side-effect-free endpoint works; this mirrors the profile scope granted
/// by `user:profile` in the OAuth scope list.
const PROFILE_ENDPOINT: &str = "https://api.anthropic.com/api/oauth/profile";

/// Minimal-cost endpoint used for the Phase 2 probe.
const MESSAGES_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Spawn a background task that proactively refreshes expiring tokens and
/// probes rate-limited accounts for recovery.
///
/// Runs every `interval`. Tokens expiring within `refresh_threshold` are
/// refreshed; `RATE_LIMITED` accounts are probed every cycle regardless of
/// `resetsAt` so a generous upstream reset is caught early.
pub fn spawn_refresh_task(
    registry: Arc<Registry>,
    interval: Duration,
    refresh_threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick — tokens were just loaded.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&registry, refresh_threshold).await;
            probe_cycle(&registry).await;
        }
    })
}

/// Run one refresh cycle: check all accounts and refresh expiring tokens.
async fn refresh_cycle(registry: &Registry, threshold: Duration) {
    let ids = registry.account_ids().await;
    let store = registry.credential_store();
    let client = reqwest::Client::new();
    let threshold_millis = threshold.as_millis() as u64;
    let now_millis = now_ms();

    for id in &ids {
        let credential = match store.get(id).await {
            Some(c) => c,
            None => continue,
        };

        if credential.expires > now_millis + threshold_millis {
            continue;
        }

        debug!(account_id = id, "token expiring within threshold, refreshing");

        match anthropic_auth::refresh_token(&client, &credential.refresh).await {
            Ok(token_response) => {
                let new_expires = now_millis + (token_response.expires_in * 1000);
                if let Err(e) = store
                    .update_token(
                        id,
                        token_response.access_token,
                        token_response.refresh_token,
                        new_expires,
                    )
                    .await
                {
                    warn!(account_id = id, error = %e, "failed to persist refreshed token");
                }
                info!(account_id = id, "background token refresh succeeded");
            }
            Err(anthropic_auth::Error::InvalidCredentials(msg)) => {
                warn!(account_id = id, error = %msg, "refresh token rejected, marking invalid");
                if let Err(e) = registry.mark_invalid(id).await {
                    warn!(account_id = id, error = %e, "failed to persist invalid status");
                }
            }
            Err(e) => {
                warn!(account_id = id, error = %e, "background refresh failed (transient), will retry next cycle");
            }
        }
    }
}

/// Run one probe cycle over every currently `RATE_LIMITED` account.
async fn probe_cycle(registry: &Registry) {
    let accounts = registry.list().await;

    for account in accounts {
        if !matches!(account.status, Status::RateLimited { .. }) {
            continue;
        }

        if let Err(e) = probe_account(registry, &account.id).await {
            warn!(account_id = %account.id, error = %e, "probe cycle failed for account");
        }
    }
}

/// Run the §4.7 two-phase probe for one account right now and return the
/// status it settles on. Shared by the background `probe_cycle`,
/// admin-initiated `Registry::refresh`, and `batch_refresh` below, so
/// on-demand and scheduled probing can never drift apart.
pub(crate) async fn probe_account(registry: &Registry, account_id: &str) -> Result<Status> {
    let client = reqwest::Client::new();
    let credential = registry
        .credential_store()
        .get(account_id)
        .await
        .ok_or_else(|| crate::error::Error::NotFound(account_id.to_string()))?;

    match probe_phase_one(&client, &credential.access).await {
        Classification::Permanent => {
            warn!(account_id, "phase 1 probe rejected credentials");
            registry.mark_invalid(account_id).await?;
            return Ok(Status::Invalid);
        }
        Classification::QuotaExceeded => {
            debug!(account_id, "phase 1 probe still quota exhausted");
            return registry.status_of(account_id).await;
        }
        Classification::Transient => {}
    }

    match probe_phase_two(&client, &credential.access).await {
        Classification::Transient => {
            info!(account_id, "phase 2 probe succeeded, clearing rate limit");
            registry.clear_rate_limit(account_id).await?;
            Ok(Status::Valid)
        }
        Classification::QuotaExceeded => {
            debug!(account_id, "phase 2 probe still quota exhausted");
            registry.status_of(account_id).await
        }
        Classification::Permanent => {
            warn!(account_id, "phase 2 probe rejected credentials");
            registry.mark_invalid(account_id).await?;
            Ok(Status::Invalid)
        }
    }
}

/// Admin-initiated batch refresh (spec §4.2 `batchRefresh`): probe every id
/// in `ids`, at most `max_concurrency` in flight at once, rather than the
/// background cycle's unbounded sweep over every rate-limited account.
pub async fn batch_refresh(
    registry: &Registry,
    ids: &[String],
    max_concurrency: usize,
) -> Vec<(String, Result<Status>)> {
    stream::iter(ids.iter().cloned())
        .map(|id| async move {
            let result = probe_account(registry, &id).await;
            (id, result)
        })
        .buffer_unordered(max_concurrency.max(1))
        .collect()
        .await
}

/// Cheap read-only check that the access token is still accepted at all.
async fn probe_phase_one(client: &reqwest::Client, access_token: &str) -> Classification {
    let response = client
        .get(PROFILE_ENDPOINT)
        .bearer_auth(access_token)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .send()
        .await;

    match response {
        Ok(r) if r.status().is_success() => Classification::Transient,
        Ok(r) => {
            let status = r.status().as_u16();
            let body = r.text().await.unwrap_or_default();
            quota::classify_status(status, &body)
        }
        Err(_) => Classification::QuotaExceeded,
    }
}

/// Minimal chat probe: a one-token completion request. Only issued for
/// accounts that already passed Phase 1, since a real 429 here still costs
/// the account a slot in its usage window.
async fn probe_phase_two(client: &reqwest::Client, access_token: &str) -> Classification {
    let body = serde_json::json!({
        "model": "claude-3-5-haiku-20241022",
        "max_tokens": 1,
        "messages": [{"role": "user", "content": "hi"}],
    });

    let response = client
        .post(MESSAGES_ENDPOINT)
        .bearer_auth(access_token)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body)
        .send()
        .await;

    match response {
        Ok(r) if r.status().is_success() => Classification::Transient,
        Ok(r) => {
            let status = r.status().as_u16();
            let text = r.text().await.unwrap_or_default();
            quota::classify_status(status, &text)
        }
        Err(_) => Classification::QuotaExceeded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anthropic_auth::{Credential, CredentialStore};
    use crate::account::Tier;

    async fn test_registry(dir: &tempfile::TempDir, accounts: &[(&str, u64)]) -> Arc<Registry> {
        let cred_path = dir.path().join("credentials.json");
        let store = Arc::new(CredentialStore::load(cred_path).await.unwrap());
        let registry = Registry::load(dir.path().join("accounts.json"), store, 10)
            .await
            .unwrap();
        for (id, expires) in accounts {
            registry
                .add(
                    id.to_string(),
                    Credential {
                        credential_type: "oauth".into(),
                        refresh: format!("rt_{id}"),
                        access: format!("at_{id}"),
                        expires: *expires,
                        cookie: None,
                    },
                    true,
                    false,
                    Tier::Max,
                )
                .await
                .unwrap();
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn refresh_cycle_skips_valid_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, &[("a", 4_102_444_800_000)]).await;

        refresh_cycle(&registry, Duration::from_secs(900)).await;

        let cred = registry.credential_store().get("a").await.unwrap();
        assert_eq!(cred.access, "at_a");
    }

    #[tokio::test]
    async fn refresh_cycle_marks_invalid_on_rejected_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let now_millis = now_ms();
        let registry = test_registry(&dir, &[("a", now_millis + 1000)]).await;

        // A bogus refresh token against the real token endpoint returns
        // 401/403, which this cycle maps to Invalid. The cycle must not
        // panic regardless of exact upstream behavior.
        refresh_cycle(&registry, Duration::from_secs(900)).await;

        let accounts = registry.list().await;
        assert_eq!(accounts.len(), 1);
    }

    #[test]
    fn classification_roundtrips_through_quota_module() {
        assert_eq!(quota::classify_status(401, ""), Classification::Permanent);
        assert_eq!(quota::classify_status(200, ""), Classification::Transient);
    }

    #[tokio::test]
    async fn probe_account_errors_on_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, &[]).await;

        let err = probe_account(&registry, "does-not-exist").await.unwrap_err();
        assert!(matches!(err, crate::error::Error::NotFound(_)));
    }

    #[tokio::test]
    async fn batch_refresh_bounds_concurrency_and_covers_every_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, &[("a", 4_102_444_800_000), ("b", 4_102_444_800_000)]).await;

        let ids = vec!["a".to_string(), "b".to_string(), "missing".to_string()];
        let results = batch_refresh(&registry, &ids, 1).await;

        assert_eq!(results.len(), 3);
        let missing = results.iter().find(|(id, _)| id == "missing").unwrap();
        assert!(missing.1.is_err());
    }
}
