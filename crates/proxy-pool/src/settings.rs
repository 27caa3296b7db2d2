//! Pool-wide proxy configuration.

use serde::{Deserialize, Serialize};

/// Whether and how the pool routes requests through a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// No proxy is used; `getProxy` always returns `None`.
    Disabled,
    /// A single fixed proxy URL is always returned.
    Fixed,
    /// The pool selects from a rotating list per `RotationStrategy`.
    Dynamic,
}

/// Rotation strategy for dynamic mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    Sequential,
    Random,
    RandomNoRepeat,
    PerAccount,
}

/// Cause of a reported proxy failure, driving the quarantine policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// Transport-level fault (connect refused, timeout, TLS failure) after
    /// the HTTP client's in-process retries were exhausted.
    Transport,
    /// Upstream responded HTTP 403 while this proxy was in use.
    Http403,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    pub mode: Mode,
    #[serde(default)]
    pub fixed_url: Option<String>,
    #[serde(default = "default_strategy")]
    pub rotation_strategy: RotationStrategy,
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_seconds: u64,
    #[serde(default = "default_cooldown_duration")]
    pub cooldown_duration_seconds: u64,
    /// Strategy `per_account` falls back to this when no account identity
    /// (and no cookie digest) is available to hash.
    #[serde(default = "default_fallback_strategy")]
    pub fallback_strategy: RotationStrategy,
}

fn default_strategy() -> RotationStrategy {
    RotationStrategy::Sequential
}

fn default_rotation_interval() -> u64 {
    300
}

fn default_cooldown_duration() -> u64 {
    300
}

fn default_fallback_strategy() -> RotationStrategy {
    RotationStrategy::Random
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            mode: Mode::Disabled,
            fixed_url: None,
            rotation_strategy: default_strategy(),
            rotation_interval_seconds: default_rotation_interval(),
            cooldown_duration_seconds: default_cooldown_duration(),
            fallback_strategy: default_fallback_strategy(),
        }
    }
}
