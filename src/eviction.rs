//! Idle expiry and the background reaper enforcing it

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::errors::PoolError;
use crate::factory::Factory;
use crate::item::ItemState;
use crate::pool::Shared;
use crate::registry::PushError;

/// Whether an item has sat idle for at least `idle_timeout`.
pub(crate) fn is_idle_expired(state: &ItemState, idle_timeout: Option<Duration>) -> bool {
    idle_timeout.is_some_and(|timeout| state.idle_for() >= timeout)
}

/// Walk the idle set, disposing items that outlive `idle_timeout`.
///
/// Each item is pulled, then pushed back with a deadline equal to its
/// remaining time to live, so it stays available to callers while the
/// deadline is still enforced. Stale items are disposed back to back;
/// after a survivor the reaper pauses for `min(idle_timeout, reap_interval)`.
pub(crate) async fn run_reaper<F: Factory>(
    shared: Arc<Shared<F>>,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let pause = idle_timeout.min(shared.config.reap_interval);
    loop {
        let entry = tokio::select! {
            _ = shutdown.changed() => break,
            pulled = shared.registry.pull() => match pulled {
                Ok(entry) => entry,
                Err(_) => break,
            },
        };

        let remaining = idle_timeout
            .checked_sub(entry.state.idle_for())
            .filter(|remaining| !remaining.is_zero());
        let Some(remaining) = remaining else {
            shared.dispose(entry, PoolError::IdleTimeout);
            continue;
        };

        match shared.registry.push_within(entry, remaining).await {
            Ok(()) => {}
            Err(PushError::Full(entry)) => {
                shared.dispose(entry, PoolError::IdleTimeout);
                continue;
            }
            Err(PushError::Closed(entry)) => {
                shared.dispose(entry, PoolError::PoolClosed);
                break;
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
    debug!(pool = %shared.name(), "idle reaper stopped");
}
