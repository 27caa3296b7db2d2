//! Best-effort upstream conversation cleanup, implemented by the Web driver.
//!
//! Kept as a trait so `session-manager` does not depend on `upstream` (which
//! itself depends on `session-manager` for the `Session` type).

use std::future::Future;
use std::pin::Pin;

pub trait ConversationCloser: Send + Sync {
    /// Delete a server-side conversation. Best-effort: failures are logged
    /// by the implementation and never propagated.
    fn close<'a>(
        &'a self,
        account_id: &'a str,
        conversation_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// No-op closer, used when a session never reached the web path.
pub struct NoopCloser;

impl ConversationCloser for NoopCloser {
    fn close<'a>(
        &'a self,
        _account_id: &'a str,
        _conversation_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}
