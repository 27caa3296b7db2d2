//! Account Registry for Anthropic OAuth/Web accounts
//!
//! Tracks a fleet of Claude.ai/Claude-API accounts: capability flags
//! (`canOAuth`/`canWeb`), subscription tier, runtime status
//! (`VALID`/`INVALID`/`RATE_LIMITED`), per-account session counts, and
//! bound-session stickiness for the Web path. Credential bundles (access/
//! refresh token, optional session cookie) are delegated to
//! `anthropic_auth::CredentialStore`; this crate owns its own fleet
//! metadata file, persisted with the same atomic temp-file+rename
//! discipline.
//!
//! Account lifecycle:
//! 1. Admin adds account via admin API → credential + metadata stored, status `VALID`.
//! 2. Orchestrator selects account (`pickForOAuth`/`pickForSession`) per request.
//! 3. Upstream returns 429 with quota-exhaustion message → `RATE_LIMITED` with `resetsAt`.
//! 4. Upstream returns 401/403 → `INVALID` permanently (until a manual refresh revalidates).
//! 5. `resetsAt` elapses, or a background probe confirms recovery → back to `VALID`.
//! 6. Background task refreshes tokens proactively before expiration and probes rate-limited accounts.

pub mod account;
pub mod error;
pub mod quota;
pub mod refresh;
pub mod registry;

pub use account::{Account, AccountMeta, SelectedAccount, Status, Tier};
pub use error::{Error, Result};
pub use quota::{Classification, classify_429, classify_status};
pub use refresh::{batch_refresh, spawn_refresh_task};
pub use registry::Registry;
