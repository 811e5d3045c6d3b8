//! Core pool implementation

use crate::config::PoolConfig;
use crate::errors::{PoolError, PoolResult};
use crate::eviction::{self, is_idle_expired};
use crate::factory::Factory;
use crate::health::HealthStatus;
use crate::item::{Entry, ItemId, ItemState};
use crate::metrics::{MetricsExporter, MetricsTracker, PoolMetrics};
use crate::registry::{IdleRegistry, PushError};
use crate::replenish;

use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// State shared by the pool, its handles and its background tasks.
pub(crate) struct Shared<F: Factory> {
    pub config: PoolConfig,
    pub factory: F,
    pub registry: IdleRegistry<Entry<F::Resource>>,
    /// One permit per item that may still be created.
    pub gate: Semaphore,
    pub records: DashMap<ItemId, Arc<ItemState>>,
    pub metrics: MetricsTracker,
    pub shutdown: watch::Sender<bool>,
    pub runtime: Handle,
    signal: mpsc::Sender<()>,
    acquire_timeout: Mutex<Option<Duration>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<F: Factory> Shared<F> {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn total_count(&self) -> usize {
        self.config
            .max_total
            .saturating_sub(self.gate.available_permits())
    }

    pub fn next_item_id(&self) -> ItemId {
        ItemId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Ask the replenisher for another item. Extra requests coalesce.
    pub fn request_replenish(&self) {
        let _ = self.signal.try_send(());
    }

    fn is_active(&self, id: ItemId) -> bool {
        self.records.get(&id).is_some_and(|state| state.is_busy())
    }

    fn snapshot(&self) -> PoolMetrics {
        self.metrics.get_metrics(
            self.total_count(),
            self.registry.len(),
            self.config.max_total,
        )
    }

    /// Drop the bookkeeping of an item leaving the pool and free its slot.
    fn free_slot(&self, id: ItemId) {
        self.records.remove(&id);
        self.gate.add_permits(1);
    }

    fn retire(&self, id: ItemId, state: &ItemState, reason: PoolError) {
        self.free_slot(id);
        self.metrics.record_disposal(&reason);
        match &reason {
            PoolError::Factory(_) | PoolError::Resource(_) => {
                warn!(pool = %self.name(), item = %id, error = %reason, "item disposed")
            }
            _ => debug!(pool = %self.name(), item = %id, reason = %reason, "item disposed"),
        }
        state.set_error(reason);
    }

    /// Remove an item from the pool for good. Only the first disposal of an
    /// item has any effect.
    pub fn dispose(self: &Arc<Self>, entry: Entry<F::Resource>, reason: PoolError) {
        let Entry { id, state, resource } = entry;
        if !state.mark_disposed() {
            return;
        }
        let replace = !reason.is_sentinel();
        self.retire(id, &state, reason);
        self.destroy_detached(resource);
        if replace && !self.is_closed() {
            self.request_replenish();
        }
    }

    fn destroy_detached(self: &Arc<Self>, resource: F::Resource) {
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            shared.factory.destroy(resource).await;
        });
    }

    /// Put an idle item back, falling back to a bounded wait when the idle
    /// set is momentarily full.
    pub fn put_back(self: &Arc<Self>, entry: Entry<F::Resource>) {
        match self.registry.try_push(entry) {
            Ok(()) => {}
            Err(PushError::Closed(entry)) => self.dispose(entry, PoolError::PoolClosed),
            Err(PushError::Full(entry)) => {
                let shared = Arc::clone(self);
                self.runtime.spawn(async move {
                    let grace = shared.config.release_grace;
                    match shared.registry.push_within(entry, grace).await {
                        Ok(()) => {}
                        Err(PushError::Full(entry)) => shared.dispose(entry, PoolError::IdleFull),
                        Err(PushError::Closed(entry)) => {
                            shared.dispose(entry, PoolError::PoolClosed)
                        }
                    }
                });
            }
        }
    }

    fn release(self: &Arc<Self>, id: ItemId, resource: F::Resource) {
        let state = self.records.get(&id).map(|state| Arc::clone(state.value()));
        let Some(state) = state.filter(|state| !state.is_disposed()) else {
            warn!(pool = %self.name(), item = %id, "released item is no longer pooled");
            self.destroy_detached(resource);
            return;
        };
        state.mark_idle();
        MetricsTracker::incr(&self.metrics.total_released);
        self.put_back(Entry::new(id, state, resource));
    }

    fn discard(self: &Arc<Self>, id: ItemId, resource: F::Resource, reason: PoolError) {
        let state = self.records.get(&id).map(|state| Arc::clone(state.value()));
        match state {
            Some(state) => self.dispose(Entry::new(id, state, resource), reason),
            None => self.destroy_detached(resource),
        }
    }

    fn detach(&self, id: ItemId) {
        let state = self.records.get(&id).map(|state| Arc::clone(state.value()));
        if let Some(state) = state
            && state.mark_disposed()
        {
            self.free_slot(id);
            MetricsTracker::incr(&self.metrics.detached);
            debug!(pool = %self.name(), item = %id, "item detached");
            state.set_error(PoolError::Discarded);
        }
    }

    /// Pull an item and get it ready for a caller.
    async fn checkout(self: &Arc<Self>, timeout: Option<Duration>) -> PoolResult<Entry<F::Resource>> {
        let deadline = timeout.map(|timeout| (timeout, Instant::now() + timeout));
        loop {
            let pulled = match self.registry.try_pull() {
                Ok(Some(entry)) => Ok(entry),
                Ok(None) => {
                    self.request_replenish();
                    match deadline {
                        Some((timeout, at)) => {
                            match tokio::time::timeout_at(at, self.registry.pull()).await {
                                Ok(pulled) => pulled,
                                Err(_) => {
                                    MetricsTracker::incr(&self.metrics.acquire_timeouts);
                                    return Err(PoolError::GetTimeout(timeout));
                                }
                            }
                        }
                        None => self.registry.pull().await,
                    }
                }
                Err(closed) => Err(closed),
            };
            let entry = pulled.map_err(|_| PoolError::PoolClosed)?;
            self.request_replenish();

            if entry.state.is_disposed() {
                continue;
            }
            let use_count = entry.state.check_out();
            if is_idle_expired(&entry.state, self.config.idle_timeout) {
                self.dispose(entry, PoolError::IdleTimeout);
                continue;
            }

            let mut pending = PendingCheckout::new(self, entry);
            let initialized = match pending.entry.as_mut() {
                Some(entry) => self.factory.initialize(&mut entry.resource, use_count).await,
                None => continue,
            };
            let Some(entry) = pending.entry.take() else {
                continue;
            };
            match initialized {
                Ok(()) => return Ok(entry),
                Err(err) => {
                    warn!(pool = %self.name(), item = %entry.id, error = %err, "item initialization failed");
                    self.dispose(entry, PoolError::factory(err));
                }
            }
        }
    }

    /// The synchronous part of closing. Returns `false` if already closed.
    fn shut_down(self: &Arc<Self>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(pool = %self.name(), "closing pool");
        self.shutdown.send_replace(true);
        self.gate.close();
        for entry in self.registry.close() {
            self.dispose(entry, PoolError::PoolClosed);
        }
        true
    }
}

/// An item pulled for a caller but not yet handed over.
///
/// If the checkout is cancelled or unwinds while the item is held here, the
/// item is disposed so its slot is not lost.
struct PendingCheckout<'a, F: Factory> {
    shared: &'a Arc<Shared<F>>,
    entry: Option<Entry<F::Resource>>,
}

impl<'a, F: Factory> PendingCheckout<'a, F> {
    fn new(shared: &'a Arc<Shared<F>>, entry: Entry<F::Resource>) -> Self {
        Self {
            shared,
            entry: Some(entry),
        }
    }
}

impl<F: Factory> Drop for PendingCheckout<'_, F> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            let reason = if std::thread::panicking() {
                PoolError::factory_panic("initialize")
            } else {
                PoolError::Discarded
            };
            debug!(pool = %self.shared.name(), item = %entry.id, "checkout abandoned");
            self.shared.dispose(entry, reason);
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

/// A resource checked out of a [`Pool`].
///
/// Dereferences to the resource. Dropping it (or calling
/// [`close`](Pooled::close)) gives the resource back to the pool, unless an
/// error was recorded with [`record_error`](Pooled::record_error), in which
/// case the resource is disposed and its slot freed for a replacement.
pub struct Pooled<F: Factory> {
    resource: Option<F::Resource>,
    id: ItemId,
    use_count: u64,
    error: Option<PoolError>,
    shared: Arc<Shared<F>>,
}

impl<F: Factory> Pooled<F> {
    fn new(entry: Entry<F::Resource>, shared: Arc<Shared<F>>) -> Self {
        Self {
            use_count: entry.state.use_count(),
            id: entry.id,
            resource: Some(entry.resource),
            error: None,
            shared,
        }
    }

    /// Identifier of the pool record behind this resource
    pub fn item_id(&self) -> ItemId {
        self.id
    }

    /// How many times this resource has been handed out, this time included
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Mark the resource as broken. It will be disposed instead of reused.
    pub fn record_error<E>(&mut self, err: E)
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        let err = PoolError::resource(err);
        debug!(pool = %self.shared.name(), item = %self.id, error = %err, "error recorded on item");
        self.error = Some(err);
    }

    /// The error recorded on this resource, if any
    pub fn error(&self) -> Option<&PoolError> {
        self.error.as_ref()
    }

    /// Whether the pool still sees this resource as checked out
    pub fn is_active(&self) -> bool {
        self.shared.is_active(self.id)
    }

    /// Finish using the resource. Same as dropping it.
    pub fn close(self) {
        drop(self);
    }

    /// Take the resource out of the pool permanently, freeing its slot.
    pub fn take(mut this: Self) -> F::Resource {
        let resource = this.resource.take().expect("resource already taken");
        this.shared.detach(this.id);
        resource
    }

    fn finish(&mut self) {
        if let Some(resource) = self.resource.take() {
            match self.error.take() {
                Some(err) => self.shared.discard(self.id, resource, err),
                None => self.shared.release(self.id, resource),
            }
        }
    }
}

impl<F: Factory> Deref for Pooled<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("resource already taken")
    }
}

impl<F: Factory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect("resource already taken")
    }
}

impl<F: Factory> Drop for Pooled<F> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<F: Factory> fmt::Debug for Pooled<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.shared.name())
            .field("id", &self.id)
            .field("use_count", &self.use_count)
            .field("error", &self.error)
            .finish()
    }
}

/// Async pool of reusable resources built by a [`Factory`].
///
/// Items are created lazily by a background task, up to `max_total` at a
/// time, and at most `max_idle` of them wait in the pool between uses.
///
/// # Examples
///
/// ```
/// use reservoir::{Factory, Pool, PoolConfig, async_trait};
///
/// struct Buffers;
///
/// #[async_trait]
/// impl Factory for Buffers {
///     type Resource = Vec<u8>;
///     type Error = std::io::Error;
///
///     async fn create(&self) -> Result<Vec<u8>, Self::Error> {
///         Ok(Vec::with_capacity(1024))
///     }
/// }
///
/// # #[tokio::main] async fn main() {
/// let pool = Pool::new(Buffers, PoolConfig::new("buffers", 4, 4)).unwrap();
/// {
///     let mut buf = pool.acquire().await.unwrap();
///     buf.extend_from_slice(b"hello");
///     // returned to the pool when `buf` goes out of scope
/// }
/// pool.close().await.unwrap();
/// # }
/// ```
pub struct Pool<F: Factory> {
    shared: Arc<Shared<F>>,
}

impl<F: Factory> Pool<F> {
    /// Create a pool and start its background tasks on the current tokio runtime.
    pub fn new(factory: F, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            PoolError::InvalidConfig("a pool must be created inside a tokio runtime".into())
        })?;

        let requested_idle = config.max_idle;
        let config = config.normalized();
        if config.max_idle != requested_idle {
            debug!(
                pool = %config.name,
                max_total = config.max_total,
                max_idle = config.max_idle,
                "raised max_idle so every item can be returned"
            );
        }

        let (signal, signal_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            registry: IdleRegistry::new(config.max_idle),
            gate: Semaphore::new(config.max_total),
            records: DashMap::new(),
            metrics: MetricsTracker::new(),
            acquire_timeout: Mutex::new(config.acquire_timeout),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            signal,
            shutdown,
            runtime,
            factory,
            config,
        });

        shared.runtime.spawn(replenish::run_replenisher(
            Arc::clone(&shared),
            signal_rx,
            shared.shutdown.subscribe(),
        ));
        if let Some(idle_timeout) = shared.config.idle_timeout {
            shared.runtime.spawn(eviction::run_reaper(
                Arc::clone(&shared),
                idle_timeout,
                shared.shutdown.subscribe(),
            ));
        }

        info!(
            pool = %shared.config.name,
            max_total = shared.config.max_total,
            max_idle = shared.config.max_idle,
            idle_timeout = ?shared.config.idle_timeout,
            "pool created"
        );
        Ok(Self { shared })
    }

    /// Create a pool from positional limits; a zero `idle_timeout` disables expiry.
    pub fn with_limits(
        name: impl Into<String>,
        factory: F,
        max_total: usize,
        max_idle: usize,
        idle_timeout: Duration,
    ) -> PoolResult<Self> {
        let config = PoolConfig::new(name, max_total, max_idle).with_idle_timeout(idle_timeout);
        Self::new(factory, config)
    }

    /// Set how long [`acquire`](Pool::acquire) waits; `Duration::ZERO` waits forever
    pub fn set_acquire_timeout(&self, timeout: Duration) {
        *self.shared.acquire_timeout.lock() = (!timeout.is_zero()).then_some(timeout);
    }

    /// The timeout applied by [`acquire`](Pool::acquire)
    pub fn acquire_timeout(&self) -> Option<Duration> {
        *self.shared.acquire_timeout.lock()
    }

    /// Get a resource, waiting up to the configured acquire timeout.
    ///
    /// Fails with [`PoolError::GetTimeout`] when nothing became available in
    /// time and with [`PoolError::PoolClosed`] once the pool is closed.
    pub async fn acquire(&self) -> PoolResult<Pooled<F>> {
        let timeout = self.acquire_timeout();
        self.acquire_inner(timeout).await
    }

    /// Get a resource, waiting at most `timeout` (`Duration::ZERO` waits forever).
    pub async fn acquire_within(&self, timeout: Duration) -> PoolResult<Pooled<F>> {
        self.acquire_inner((!timeout.is_zero()).then_some(timeout))
            .await
    }

    async fn acquire_inner(&self, timeout: Option<Duration>) -> PoolResult<Pooled<F>> {
        if self.shared.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        trace!(pool = %self.name(), timeout = ?timeout, "acquiring item");

        let outcome = AssertUnwindSafe(self.shared.checkout(timeout))
            .catch_unwind()
            .await;
        let entry = match outcome {
            Ok(result) => result?,
            Err(panic) => {
                error!(
                    pool = %self.name(),
                    panic = panic_message(panic.as_ref()),
                    "panic while acquiring an item"
                );
                return Err(PoolError::PoolClosed);
            }
        };

        MetricsTracker::incr(&self.shared.metrics.total_acquired);
        Ok(Pooled::new(entry, Arc::clone(&self.shared)))
    }

    fn check_owner(&self, item: &Pooled<F>) {
        if !Arc::ptr_eq(&item.shared, &self.shared) {
            warn!(
                pool = %self.name(),
                owner = %item.shared.name(),
                item = %item.id,
                "item handed to a pool that does not own it"
            );
        }
    }

    /// Give a resource back for reuse, ignoring any recorded error.
    ///
    /// The resource always returns to the pool that handed it out; passing
    /// a handle from another pool only logs a warning.
    pub fn release(&self, mut item: Pooled<F>) {
        self.check_owner(&item);
        item.error = None;
        drop(item);
    }

    /// Dispose of a resource and free its slot for a replacement.
    ///
    /// Like [`release`](Pool::release), this acts on the pool that owns
    /// the handle.
    pub fn discard(&self, mut item: Pooled<F>) {
        self.check_owner(&item);
        if item.error.is_none() {
            item.error = Some(PoolError::Discarded);
        }
        drop(item);
    }

    /// Whether `item` belongs to this pool and is currently checked out
    pub fn is_active(&self, item: &Pooled<F>) -> bool {
        Arc::ptr_eq(&item.shared, &self.shared) && self.shared.is_active(item.id)
    }

    /// Close the pool, disposing every idle item, then shut the factory down.
    ///
    /// Calling it again does nothing. Resources still checked out are
    /// disposed when they come back.
    pub async fn close(&self) -> PoolResult<()> {
        if !self.shared.shut_down() {
            return Ok(());
        }
        let result = self
            .shared
            .factory
            .shutdown()
            .await
            .map_err(PoolError::factory);
        if let Err(err) = &result {
            warn!(pool = %self.name(), error = %err, "factory shutdown failed");
        }
        info!(pool = %self.name(), "pool closed");
        result
    }

    /// Whether [`close`](Pool::close) has been called
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Items alive right now, idle, checked out or being created
    pub fn total_count(&self) -> usize {
        self.shared.total_count()
    }

    /// Items waiting in the pool
    pub fn idle_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn max_total(&self) -> usize {
        self.shared.config.max_total
    }

    /// Idle capacity after normalization
    pub fn max_idle(&self) -> usize {
        self.shared.config.max_idle
    }

    /// Get pool metrics
    pub fn metrics(&self) -> PoolMetrics {
        self.shared.snapshot()
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.metrics().export()
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics_prometheus(&self, tags: Option<&HashMap<String, String>>) -> String {
        MetricsExporter::export_prometheus(&self.metrics(), self.name(), tags)
    }

    /// Get health status
    pub fn health_status(&self) -> HealthStatus {
        HealthStatus::new(
            self.idle_count(),
            self.total_count(),
            self.max_total(),
            self.is_closed(),
        )
    }

    /// A Prometheus collector reporting this pool's metrics.
    ///
    /// The collector does not keep the pool alive.
    #[cfg(feature = "metrics")]
    pub fn collector(&self) -> prometheus::Result<crate::metrics::PoolCollector> {
        let weak = Arc::downgrade(&self.shared);
        crate::metrics::PoolCollector::new(
            self.name(),
            Arc::new(move || weak.upgrade().map(|shared| shared.snapshot())),
        )
    }
}

impl<F: Factory> Drop for Pool<F> {
    fn drop(&mut self) {
        if self.shared.shut_down() {
            let shared = Arc::clone(&self.shared);
            self.shared.runtime.spawn(async move {
                if let Err(err) = shared.factory.shutdown().await {
                    warn!(pool = %shared.name(), error = %err, "factory shutdown failed");
                }
            });
        }
    }
}

impl<F: Factory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name())
            .field("total", &self.total_count())
            .field("idle", &self.idle_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
