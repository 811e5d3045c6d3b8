//! Per-item bookkeeping

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::errors::PoolError;

/// Opaque identifier linking a handed-out resource to its pool record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub(crate) u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of one pooled item.
#[derive(Debug)]
pub(crate) struct ItemState {
    busy: AtomicBool,
    disposed: AtomicBool,
    use_count: AtomicU64,
    idle_since: Mutex<Instant>,
    error: Mutex<Option<PoolError>>,
}

impl ItemState {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            use_count: AtomicU64::new(0),
            idle_since: Mutex::new(Instant::now()),
            error: Mutex::new(None),
        }
    }

    /// Mark the item as lent out and return its new use count.
    pub fn check_out(&self) -> u64 {
        self.busy.store(true, Ordering::Release);
        self.use_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn mark_idle(&self) {
        *self.idle_since.lock() = Instant::now();
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Acquire)
    }

    pub fn idle_for(&self) -> Duration {
        self.idle_since.lock().elapsed()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Flip the item to disposed. Only the first caller gets `true`.
    pub fn mark_disposed(&self) -> bool {
        self.disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_error(&self, err: PoolError) {
        *self.error.lock() = Some(err);
    }

    #[cfg(test)]
    pub fn error(&self) -> Option<PoolError> {
        self.error.lock().clone()
    }
}

/// An item travelling between the idle set and the pool's tasks.
pub(crate) struct Entry<R> {
    pub id: ItemId,
    pub state: Arc<ItemState>,
    pub resource: R,
}

impl<R> Entry<R> {
    pub fn new(id: ItemId, state: Arc<ItemState>, resource: R) -> Self {
        Self {
            id,
            state,
            resource,
        }
    }
}

impl<R> fmt::Debug for Entry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
