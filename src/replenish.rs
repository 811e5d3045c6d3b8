//! Background creation of new items

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::errors::PoolError;
use crate::factory::Factory;
use crate::item::{Entry, ItemState};
use crate::metrics::MetricsTracker;
use crate::pool::{Shared, panic_message};
use crate::registry::PushError;

/// Build items on demand until the pool shuts down.
///
/// Each signal results in at most one creation. If an item is already idle
/// the demand is considered met; otherwise the worker waits for a free slot
/// in the total-count gate and creates the item in a detached task.
pub(crate) async fn run_replenisher<F: Factory>(
    shared: Arc<Shared<F>>,
    mut signal: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = signal.recv() => {
                if received.is_none() {
                    break;
                }
            }
        }

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            pulled = shared.registry.pull() => match pulled {
                Ok(entry) => {
                    shared.put_back(entry);
                    continue;
                }
                Err(_) => break,
            },
            acquired = shared.gate.acquire() => match acquired {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        // Returned through `add_permits` when the item is disposed.
        permit.forget();

        let worker = Arc::clone(&shared);
        shared.runtime.spawn(create_item(worker));
    }
    debug!(pool = %shared.name(), "replenisher stopped");
}

async fn create_item<F: Factory>(shared: Arc<Shared<F>>) {
    let created = AssertUnwindSafe(shared.factory.create())
        .catch_unwind()
        .await;
    let failure = match created {
        Ok(Ok(resource)) => {
            admit(&shared, resource).await;
            return;
        }
        Ok(Err(err)) => PoolError::factory(err),
        Err(panic) => PoolError::factory_panic(panic_message(panic.as_ref())),
    };

    shared.gate.add_permits(1);
    MetricsTracker::incr(&shared.metrics.creation_failures);
    warn!(pool = %shared.name(), error = %failure, "failed to create item");

    // Only an empty pool retries by itself, after a cooldown. Otherwise the
    // next caller that finds no idle item asks again.
    if shared.total_count() < 1 && !shared.is_closed() {
        let mut shutdown = shared.shutdown.subscribe();
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(shared.config.replenish_cooldown) => {}
        }
        shared.request_replenish();
    }
}

async fn admit<F: Factory>(shared: &Arc<Shared<F>>, resource: F::Resource) {
    let id = shared.next_item_id();
    let state = Arc::new(ItemState::new());
    shared.records.insert(id, Arc::clone(&state));
    MetricsTracker::incr(&shared.metrics.items_created);
    debug!(
        pool = %shared.name(),
        item = %id,
        total = shared.total_count(),
        idle = shared.registry.len(),
        "item created"
    );

    let entry = Entry::new(id, state, resource);
    match shared
        .registry
        .push_within(entry, shared.config.release_grace)
        .await
    {
        Ok(()) => {}
        Err(PushError::Full(entry)) => shared.dispose(entry, PoolError::IdleFull),
        Err(PushError::Closed(entry)) => shared.dispose(entry, PoolError::PoolClosed),
    }
}
