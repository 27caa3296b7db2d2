//! Proxy selection: rotation strategies, cooldown tracking, reload.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::proxy::{self, Proxy};
use crate::settings::{FailureCause, Mode, ProxySettings, RotationStrategy};

struct Entry {
    proxy: Proxy,
    cooldown_until: Option<Instant>,
}

impl Entry {
    /// `isAvailable` per the data model: cooldown absent, or elapsed — in
    /// which case it is cleared on read.
    fn is_available(&mut self, now: Instant) -> bool {
        match self.cooldown_until {
            None => true,
            Some(until) if now >= until => {
                self.cooldown_until = None;
                true
            }
            Some(_) => false,
        }
    }
}

struct NoRepeatState {
    order: Vec<usize>,
    pos: usize,
}

/// Snapshot of pool health for the admin status endpoint.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub mode: Mode,
    pub total: usize,
    pub available: usize,
    pub current_reference: Option<String>,
    pub strategy: RotationStrategy,
}

/// Owns the configured set of upstream proxies and answers selection
/// queries under the configured rotation strategy.
pub struct Pool {
    entries: RwLock<Vec<Entry>>,
    settings: RwLock<ProxySettings>,
    sequential_cursor: AtomicUsize,
    no_repeat: StdMutex<NoRepeatState>,
}

impl Pool {
    pub fn new(settings: ProxySettings, proxies: Vec<Proxy>) -> Self {
        let n = proxies.len();
        let entries = proxies
            .into_iter()
            .map(|proxy| Entry {
                proxy,
                cooldown_until: None,
            })
            .collect();
        info!(count = n, mode = ?settings.mode, "proxy pool initialized");
        Self {
            entries: RwLock::new(entries),
            settings: RwLock::new(settings),
            sequential_cursor: AtomicUsize::new(0),
            no_repeat: StdMutex::new(NoRepeatState {
                order: shuffled_order(n),
                pos: 0,
            }),
        }
    }

    /// Select a proxy for this call. `account_id` is the stable identity
    /// used by the `per_account` strategy when present.
    pub async fn get_proxy(&self, account_id: Option<&str>) -> Result<Option<Proxy>> {
        let settings = self.settings.read().await.clone();
        match settings.mode {
            Mode::Disabled => Ok(None),
            Mode::Fixed => {
                let url = settings
                    .fixed_url
                    .as_deref()
                    .ok_or_else(|| Error::InvalidProxySpec("fixed mode with no fixed_url".into()))?;
                Ok(Some(proxy::parse(url)?))
            }
            Mode::Dynamic => self.get_dynamic(&settings, account_id).await.map(Some),
        }
    }

    async fn get_dynamic(&self, settings: &ProxySettings, account_id: Option<&str>) -> Result<Proxy> {
        let mut entries = self.entries.write().await;
        let n = entries.len();
        if n == 0 {
            return Err(Error::AllProxiesUnavailable { total: 0 });
        }
        let now = Instant::now();

        let idx = match settings.rotation_strategy {
            RotationStrategy::Sequential => self.select_sequential(&mut entries, now),
            RotationStrategy::Random => select_random(&mut entries, now),
            RotationStrategy::RandomNoRepeat => self.select_random_no_repeat(&mut entries, now),
            RotationStrategy::PerAccount => {
                self.select_per_account(&mut entries, now, account_id, settings.fallback_strategy)
            }
        };

        match idx {
            Some(i) => Ok(entries[i].proxy.clone()),
            None => Err(Error::AllProxiesUnavailable { total: n }),
        }
    }

    fn select_sequential(&self, entries: &mut [Entry], now: Instant) -> Option<usize> {
        let n = entries.len();
        let current = self.sequential_cursor.load(Ordering::Relaxed) % n;
        linear_probe(entries, current, now)
    }

    fn select_random_no_repeat(&self, entries: &mut [Entry], now: Instant) -> Option<usize> {
        let n = entries.len();
        let mut state = self.no_repeat.lock().expect("no_repeat lock poisoned");
        if state.order.len() != n {
            state.order = shuffled_order(n);
            state.pos = 0;
        }
        for _ in 0..n {
            if state.pos >= state.order.len() {
                state.order = shuffled_order(n);
                state.pos = 0;
            }
            let idx = state.order[state.pos];
            state.pos += 1;
            if entries[idx].is_available(now) {
                return Some(idx);
            }
        }
        None
    }

    fn select_per_account(
        &self,
        entries: &mut [Entry],
        now: Instant,
        account_id: Option<&str>,
        fallback: RotationStrategy,
    ) -> Option<usize> {
        let n = entries.len();
        let Some(identity) = account_id else {
            return match fallback {
                RotationStrategy::Sequential => self.select_sequential(entries, now),
                RotationStrategy::RandomNoRepeat => self.select_random_no_repeat(entries, now),
                // PerAccount without an identity would recurse; treat as random.
                RotationStrategy::Random | RotationStrategy::PerAccount => {
                    select_random(entries, now)
                }
            };
        };
        let base = (hash_identity(identity) as usize) % n;
        linear_probe(entries, base, now)
    }

    /// Advance the sequential cursor. Called by the background rotation
    /// ticker, not by `get_proxy` itself.
    pub fn advance_sequential(&self) {
        self.sequential_cursor.fetch_add(1, Ordering::Relaxed);
    }

    /// Report a proxy failure. Sets `cooldownUntil = now + cooldownDuration`.
    pub async fn report_failure(&self, proxy_key: &str, cause: FailureCause) {
        let cooldown = Duration::from_secs(self.settings.read().await.cooldown_duration_seconds);
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.proxy.key() == proxy_key) {
            entry.cooldown_until = Some(Instant::now() + cooldown);
            warn!(proxy = proxy_key, ?cause, "proxy quarantined");
        }
    }

    /// Replace the pool contents; strategy state is reset.
    pub async fn reload(&self, text: &str) -> Result<()> {
        let proxies = proxy::parse_list(text)?;
        let n = proxies.len();
        let mut entries = self.entries.write().await;
        *entries = proxies
            .into_iter()
            .map(|proxy| Entry {
                proxy,
                cooldown_until: None,
            })
            .collect();
        self.sequential_cursor.store(0, Ordering::Relaxed);
        let mut state = self.no_repeat.lock().expect("no_repeat lock poisoned");
        state.order = shuffled_order(n);
        state.pos = 0;
        info!(count = n, "proxy pool reloaded");
        Ok(())
    }

    pub async fn status(&self) -> PoolStatus {
        let settings = self.settings.read().await.clone();
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let total = entries.len();
        let available = entries.iter_mut().filter(|e| e.is_available(now)).count();
        let current_reference = match settings.mode {
            Mode::Dynamic if settings.rotation_strategy == RotationStrategy::Sequential && total > 0 => {
                let idx = self.sequential_cursor.load(Ordering::Relaxed) % total;
                Some(entries[idx].proxy.redacted_url())
            }
            Mode::Fixed => settings.fixed_url.clone(),
            _ => None,
        };
        PoolStatus {
            mode: settings.mode,
            total,
            available,
            current_reference,
            strategy: settings.rotation_strategy,
        }
    }

    /// Redacted list of all configured proxies, for the admin API.
    pub async fn list_redacted(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.proxy.redacted_url())
            .collect()
    }
}

fn select_random(entries: &mut [Entry], now: Instant) -> Option<usize> {
    let healthy: Vec<usize> = entries
        .iter_mut()
        .enumerate()
        .filter(|(_, e)| e.is_available(now))
        .map(|(i, _)| i)
        .collect();
    if healthy.is_empty() {
        return None;
    }
    let pick = rand::rng().random_range(0..healthy.len());
    Some(healthy[pick])
}

fn linear_probe(entries: &mut [Entry], start: usize, now: Instant) -> Option<usize> {
    let n = entries.len();
    for offset in 0..n {
        let idx = (start + offset) % n;
        if entries[idx].is_available(now) {
            return Some(idx);
        }
    }
    None
}

fn shuffled_order(n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = rand::rng();
    // Fisher-Yates
    for i in (1..order.len()).rev() {
        let j = rng.random_range(0..=i);
        order.swap(i, j);
    }
    order
}

fn hash_identity(identity: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    identity.hash(&mut hasher);
    hasher.finish()
}
