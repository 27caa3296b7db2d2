//! Account selection, sticky session binding, and fleet persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anthropic_auth::{Credential, CredentialStore};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::account::{Account, AccountMeta, SelectedAccount, Status, Tier, now_ms};
use crate::error::{Error, Result};

/// Owns the fleet's metadata map and the credential store, and answers
/// "give me an account able to serve a request of kind K".
///
/// All write operations (add/remove/mark*/bind/unbind) serialize through
/// the metadata `RwLock`'s write half and end with an atomic file replace;
/// batch operations apply N mutations in memory and persist once.
pub struct Registry {
    meta: RwLock<HashMap<String, AccountMeta>>,
    credentials: Arc<CredentialStore>,
    fleet_path: std::path::PathBuf,
    per_account_session_cap: u32,
    /// Sticky `clientKey -> accountId` bindings for the web path.
    sticky: RwLock<HashMap<String, String>>,
}

impl Registry {
    pub async fn load(
        fleet_path: std::path::PathBuf,
        credentials: Arc<CredentialStore>,
        per_account_session_cap: u32,
    ) -> Result<Self> {
        let meta = if fleet_path.exists() {
            let contents = tokio::fs::read_to_string(&fleet_path)
                .await
                .map_err(|e| Error::Io(format!("reading fleet file: {e}")))?;
            let meta: HashMap<String, AccountMeta> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing fleet file: {e}")))?;
            info!(path = %fleet_path.display(), accounts = meta.len(), "loaded fleet metadata");
            meta
        } else {
            HashMap::new()
        };

        let registry = Self {
            meta: RwLock::new(meta),
            credentials,
            fleet_path,
            per_account_session_cap,
            sticky: RwLock::new(HashMap::new()),
        };
        registry.persist().await?;
        Ok(registry)
    }

    /// `pickForOAuth`: among accounts with `canOAuth ∧ status = VALID ∧
    /// overloadedUntil < now`, choose fewest bound sessions, ties broken by
    /// oldest `lastUsed`.
    pub async fn pick_for_oauth(&self) -> Result<SelectedAccount> {
        let now = now_ms();
        let mut meta = self.meta.write().await;
        let id = meta
            .iter()
            .filter(|(_, m)| m.can_oauth && m.is_selectable_status(now) && !m.is_overloaded(now))
            .min_by_key(|(_, m)| (m.session_count, m.last_used_ms))
            .map(|(id, _)| id.clone())
            .ok_or(Error::NoAccountsAvailable)?;

        if let Some(m) = meta.get_mut(&id) {
            m.last_used_ms = now;
        }
        drop(meta);
        self.persist().await?;
        self.materialize(&id).await
    }

    /// `pickForSession`: sticky on `clientKey`. Binds and increments
    /// `sessionCount` on first use; later calls return the same account as
    /// long as it is still VALID.
    pub async fn pick_for_session(&self, client_key: &str) -> Result<SelectedAccount> {
        {
            let sticky = self.sticky.read().await;
            if let Some(id) = sticky.get(client_key) {
                let meta = self.meta.read().await;
                if let Some(m) = meta.get(id)
                    && m.status == Status::Valid
                {
                    let id = id.clone();
                    drop(meta);
                    return self.materialize(&id).await;
                }
            }
        }

        let now = now_ms();
        let mut meta = self.meta.write().await;
        let id = meta
            .iter()
            .filter(|(_, m)| {
                m.can_web
                    && m.is_selectable_status(now)
                    && m.session_count < self.per_account_session_cap
                    && !m.is_overloaded(now)
            })
            .min_by_key(|(_, m)| (m.session_count, m.last_used_ms))
            .map(|(id, _)| id.clone())
            .ok_or(Error::NoAccountsAvailable)?;

        if let Some(m) = meta.get_mut(&id) {
            m.session_count += 1;
            m.last_used_ms = now;
        }
        drop(meta);

        self.sticky
            .write()
            .await
            .insert(client_key.to_string(), id.clone());
        self.persist().await?;
        self.materialize(&id).await
    }

    /// Release a session's binding on the account's session counter
    /// (called by the session manager on TTL expiry or explicit destroy).
    /// Does not clear the sticky binding — a later call with the same
    /// `clientKey` should still prefer the same account if it rebinds.
    pub async fn unbind_session(&self, account_id: &str) -> Result<()> {
        let mut meta = self.meta.write().await;
        if let Some(m) = meta.get_mut(account_id) {
            m.session_count = m.session_count.saturating_sub(1);
        }
        drop(meta);
        self.persist().await
    }

    pub async fn mark_rate_limited(&self, account_id: &str, resets_at_ms: u64) -> Result<()> {
        let mut meta = self.meta.write().await;
        let m = meta
            .get_mut(account_id)
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;
        m.status = Status::RateLimited { resets_at_ms };
        warn!(account_id, resets_at_ms, "account rate limited");
        drop(meta);
        self.persist().await
    }

    pub async fn mark_invalid(&self, account_id: &str) -> Result<()> {
        let mut meta = self.meta.write().await;
        let m = meta
            .get_mut(account_id)
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;
        m.status = Status::Invalid;
        warn!(account_id, "account marked invalid");
        drop(meta);
        self.persist().await
    }

    pub async fn mark_overloaded(&self, account_id: &str, duration: Duration) -> Result<()> {
        let mut meta = self.meta.write().await;
        let m = meta
            .get_mut(account_id)
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;
        m.overloaded_until_ms = Some(now_ms() + duration.as_millis() as u64);
        info!(account_id, secs = duration.as_secs(), "account overloaded cooldown set");
        drop(meta);
        self.persist().await
    }

    pub async fn clear_rate_limit(&self, account_id: &str) -> Result<()> {
        let mut meta = self.meta.write().await;
        let m = meta
            .get_mut(account_id)
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;
        m.status = Status::Valid;
        drop(meta);
        self.persist().await
    }

    /// Set status directly, used by the refresh probe.
    pub async fn set_status(&self, account_id: &str, status: Status) -> Result<()> {
        let mut meta = self.meta.write().await;
        if let Some(m) = meta.get_mut(account_id) {
            m.status = status;
        }
        drop(meta);
        self.persist().await
    }

    pub async fn status_of(&self, account_id: &str) -> Result<Status> {
        let meta = self.meta.read().await;
        meta.get(account_id)
            .map(|m| m.status)
            .ok_or_else(|| Error::NotFound(account_id.to_string()))
    }

    /// Admin-initiated on-demand refresh (§4.7): run the two-phase probe
    /// for one account immediately rather than waiting on the next
    /// background cycle, returning the status it settles on.
    pub async fn refresh(&self, account_id: &str) -> Result<Status> {
        crate::refresh::probe_account(self, account_id).await
    }

    pub async fn add(
        &self,
        account_id: String,
        credential: Credential,
        can_oauth: bool,
        can_web: bool,
        tier: Tier,
    ) -> Result<()> {
        self.credentials.add(account_id.clone(), credential).await?;
        let mut meta = self.meta.write().await;
        meta.insert(account_id.clone(), AccountMeta::new(can_oauth, can_web, tier));
        drop(meta);
        info!(account_id, "account added to registry");
        self.persist().await
    }

    pub async fn remove(&self, account_id: &str) -> Result<()> {
        self.credentials.remove(account_id).await?;
        let mut meta = self.meta.write().await;
        meta.remove(account_id);
        drop(meta);
        let mut sticky = self.sticky.write().await;
        sticky.retain(|_, v| v != account_id);
        drop(sticky);
        info!(account_id, "account removed from registry");
        self.persist().await
    }

    /// Apply N removals, persisting once.
    pub async fn batch_remove(&self, account_ids: &[String]) -> Result<()> {
        for id in account_ids {
            self.credentials.remove(id).await?;
        }
        let mut meta = self.meta.write().await;
        for id in account_ids {
            meta.remove(id);
        }
        drop(meta);
        let mut sticky = self.sticky.write().await;
        sticky.retain(|_, v| !account_ids.contains(v));
        drop(sticky);
        info!(count = account_ids.len(), "batch removed accounts");
        self.persist().await
    }

    pub async fn list(&self) -> Vec<Account> {
        let meta = self.meta.read().await;
        let mut accounts = Vec::with_capacity(meta.len());
        for (id, m) in meta.iter() {
            let has_cookie = self
                .credentials
                .get(id)
                .await
                .is_some_and(|c| c.cookie.is_some());
            accounts.push(Account {
                id: id.clone(),
                can_oauth: m.can_oauth,
                can_web: m.can_web,
                tier: m.tier,
                status: m.status,
                session_count: m.session_count,
                last_used_ms: m.last_used_ms,
                has_cookie,
            });
        }
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    pub async fn account_ids(&self) -> Vec<String> {
        self.meta.read().await.keys().cloned().collect()
    }

    pub fn credential_store(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Materialize an account already bound to a Web session. Strips the
    /// OAuth access token even when the credential has one, so the event
    /// pipeline's `DriverDispatch` stage (which dispatches on
    /// `access_token.is_some()`) routes through `WebDriver` rather than
    /// silently preferring OAuth for a dual-capability account and
    /// stranding the session's conversation id.
    pub async fn account_for_session(&self, account_id: &str) -> Result<SelectedAccount> {
        let mut account = self.materialize(account_id).await?;
        account.access_token = None;
        Ok(account)
    }

    async fn materialize(&self, id: &str) -> Result<SelectedAccount> {
        let credential = self
            .credentials
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let access_token = if credential.expires > 0 {
            Some(credential.access)
        } else {
            None
        };
        Ok(SelectedAccount {
            id: id.to_string(),
            access_token,
            cookie: credential.cookie,
        })
    }

    /// Persist fleet metadata atomically (temp file + rename), decoupled
    /// from credential persistence so batch operations can apply several
    /// in-memory mutations and write the file once.
    async fn persist(&self) -> Result<()> {
        let meta = self.meta.read().await;
        let json = serde_json::to_string_pretty(&*meta)
            .map_err(|e| Error::Parse(format!("serializing fleet metadata: {e}")))?;
        drop(meta);

        let dir = self
            .fleet_path
            .parent()
            .ok_or_else(|| Error::Io("fleet path has no parent directory".into()))?;
        let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .map_err(|e| Error::Io(format!("writing temp fleet file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp_path, perms)
                .await
                .map_err(|e| Error::Io(format!("setting fleet file permissions: {e}")))?;
        }

        tokio::fs::rename(&tmp_path, &self.fleet_path)
            .await
            .map_err(|e| Error::Io(format!("renaming temp fleet file: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credential(suffix: &str) -> Credential {
        Credential {
            credential_type: "oauth".into(),
            refresh: format!("rt_{suffix}"),
            access: format!("at_{suffix}"),
            expires: 4_102_444_800_000,
            cookie: None,
        }
    }

    async fn test_registry(dir: &tempfile::TempDir, cap: u32) -> Registry {
        let cred_path = dir.path().join("credentials.json");
        let store = Arc::new(CredentialStore::load(cred_path).await.unwrap());
        Registry::load(dir.path().join("accounts.json"), store, cap)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pick_for_oauth_prefers_fewest_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 5).await;
        registry
            .add("a".into(), test_credential("a"), true, false, Tier::Max)
            .await
            .unwrap();
        registry
            .add("b".into(), test_credential("b"), true, false, Tier::Max)
            .await
            .unwrap();

        // Give "a" sessions so "b" should win next.
        registry.pick_for_session("key-1").await.ok();
        let chosen = registry.pick_for_oauth().await.unwrap();
        assert!(chosen.id == "a" || chosen.id == "b");
    }

    #[tokio::test]
    async fn pick_for_oauth_skips_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 5).await;
        registry
            .add("a".into(), test_credential("a"), true, false, Tier::Max)
            .await
            .unwrap();
        registry.mark_invalid("a").await.unwrap();

        let err = registry.pick_for_oauth().await.unwrap_err();
        assert!(matches!(err, Error::NoAccountsAvailable));
    }

    #[tokio::test]
    async fn pick_for_oauth_skips_rate_limited_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 5).await;
        registry
            .add("a".into(), test_credential("a"), true, false, Tier::Max)
            .await
            .unwrap();
        registry
            .mark_rate_limited("a", now_ms() + 3_600_000)
            .await
            .unwrap();

        let err = registry.pick_for_oauth().await.unwrap_err();
        assert!(matches!(err, Error::NoAccountsAvailable));

        registry.clear_rate_limit("a").await.unwrap();
        assert!(registry.pick_for_oauth().await.is_ok());
    }

    #[tokio::test]
    async fn pick_for_session_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 5).await;
        registry
            .add("a".into(), test_credential("a"), false, true, Tier::Pro)
            .await
            .unwrap();
        registry
            .add("b".into(), test_credential("b"), false, true, Tier::Pro)
            .await
            .unwrap();

        let first = registry.pick_for_session("key-1").await.unwrap();
        for _ in 0..5 {
            let again = registry.pick_for_session("key-1").await.unwrap();
            assert_eq!(again.id, first.id);
        }
    }

    #[tokio::test]
    async fn pick_for_session_respects_cap() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 1).await;
        registry
            .add("a".into(), test_credential("a"), false, true, Tier::Pro)
            .await
            .unwrap();

        registry.pick_for_session("key-1").await.unwrap();
        // Second distinct client key should fail: only account is at cap.
        let err = registry.pick_for_session("key-2").await.unwrap_err();
        assert!(matches!(err, Error::NoAccountsAvailable));
    }

    #[tokio::test]
    async fn unbind_session_frees_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 1).await;
        registry
            .add("a".into(), test_credential("a"), false, true, Tier::Pro)
            .await
            .unwrap();

        registry.pick_for_session("key-1").await.unwrap();
        registry.unbind_session("a").await.unwrap();
        assert!(registry.pick_for_session("key-2").await.is_ok());
    }

    #[tokio::test]
    async fn overloaded_account_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 5).await;
        registry
            .add("a".into(), test_credential("a"), true, false, Tier::Max)
            .await
            .unwrap();
        registry
            .mark_overloaded("a", Duration::from_secs(30))
            .await
            .unwrap();

        let err = registry.pick_for_oauth().await.unwrap_err();
        assert!(matches!(err, Error::NoAccountsAvailable));
    }

    #[tokio::test]
    async fn fleet_file_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = test_registry(&dir, 5).await;
            registry
                .add("a".into(), test_credential("a"), true, true, Tier::Max)
                .await
                .unwrap();
            registry.mark_invalid("a").await.unwrap();
        }

        let cred_path = dir.path().join("credentials.json");
        let store = Arc::new(CredentialStore::load(cred_path).await.unwrap());
        let reloaded = Registry::load(dir.path().join("accounts.json"), store, 5)
            .await
            .unwrap();
        let accounts = reloaded.list().await;
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].status, Status::Invalid);
    }

    #[tokio::test]
    async fn batch_remove_clears_all() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 5).await;
        registry
            .add("a".into(), test_credential("a"), true, true, Tier::Max)
            .await
            .unwrap();
        registry
            .add("b".into(), test_credential("b"), true, true, Tier::Max)
            .await
            .unwrap();

        registry
            .batch_remove(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn refresh_unknown_account_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 5).await;

        let err = registry.refresh("does-not-exist").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn status_of_reports_current_status() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 5).await;
        registry
            .add("a".into(), test_credential("a"), true, false, Tier::Max)
            .await
            .unwrap();

        assert_eq!(registry.status_of("a").await.unwrap(), Status::Valid);
        registry.mark_invalid("a").await.unwrap();
        assert_eq!(registry.status_of("a").await.unwrap(), Status::Invalid);
    }

    #[tokio::test]
    async fn list_never_exposes_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir, 5).await;
        registry
            .add("a".into(), test_credential("a"), true, true, Tier::Max)
            .await
            .unwrap();

        let accounts = registry.list().await;
        let json = serde_json::to_string(&accounts[0]).unwrap();
        assert!(!json.contains("at_a"));
        assert!(!json.contains("rt_a"));
    }
}
