//! Background rotation ticker for the `sequential` strategy.

use std::sync::Arc;
use std::time::Duration;

use crate::pool::Pool;

/// Advance the sequential cursor every `interval`. A no-op for every other
/// rotation strategy, but harmless to run regardless since `advance_sequential`
/// is cheap and only consulted by `Sequential` selection.
pub fn spawn_rotation_ticker(pool: Arc<Pool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            pool.advance_sequential();
        }
    })
}
