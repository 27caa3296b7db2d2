//! Egress proxy pool for the account gateway.
//!
//! Owns a set of upstream HTTP/SOCKS proxies and answers "give me a proxy
//! for this account" under a configurable rotation strategy, tracking
//! per-proxy cooldowns after transport failures or a 403 while proxied.

pub mod error;
pub mod pool;
pub mod proxy;
pub mod settings;
pub mod ticker;

pub use error::{Error, Result};
pub use pool::{Pool, PoolStatus};
pub use proxy::Proxy;
pub use settings::{FailureCause, Mode, ProxySettings, RotationStrategy};
pub use ticker::spawn_rotation_ticker;
