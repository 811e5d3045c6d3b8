//! End-to-end pool behavior under timing and concurrency

use reservoir::{Factory, ItemId, Pool, PoolConfig, PoolError, async_trait};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Backend {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    failures_left: AtomicUsize,
}

struct Connector {
    backend: Arc<Backend>,
}

impl Connector {
    fn new() -> (Self, Arc<Backend>) {
        let backend = Arc::new(Backend::default());
        (
            Self {
                backend: Arc::clone(&backend),
            },
            backend,
        )
    }
}

#[async_trait]
impl Factory for Connector {
    type Resource = usize;
    type Error = io::Error;

    async fn create(&self) -> Result<usize, io::Error> {
        let failing = self
            .backend
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "backend down"));
        }
        Ok(self.backend.created.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn destroy(&self, _conn: usize) {
        self.backend.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_exhausted_pool_times_out_then_reuses_released_item() {
    let (factory, backend) = Connector::new();
    let pool = Arc::new(Pool::new(factory, PoolConfig::new("scenario", 2, 2)).unwrap());
    assert_eq!(pool.max_idle(), 3);

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_ne!(first.item_id(), second.item_id());
    assert_eq!(pool.total_count(), 2);

    pool.set_acquire_timeout(Duration::from_secs(1));
    let started = Instant::now();
    let third = pool.acquire().await;
    let waited = started.elapsed();
    assert!(matches!(third, Err(PoolError::GetTimeout(_))));
    assert!(waited >= Duration::from_secs(1));
    assert!(waited < Duration::from_millis(1800));

    let fourth = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let item = pool.acquire_within(Duration::from_secs(5)).await?;
            Ok::<_, PoolError>((item.item_id(), item.use_count()))
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let released = first.item_id();
    drop(first);

    let (id, use_count) = fourth.await.unwrap().unwrap();
    assert_eq!(id, released);
    assert_eq!(use_count, 2);
    assert_eq!(backend.created.load(Ordering::SeqCst), 2);
    drop(second);
}

#[tokio::test]
async fn test_creation_failures_are_hidden_from_waiting_caller() {
    let (factory, backend) = Connector::new();
    backend.failures_left.store(3, Ordering::SeqCst);
    let config = PoolConfig::new("flaky", 2, 3).with_replenish_cooldown(Duration::from_millis(20));
    let pool = Pool::new(factory, config).unwrap();

    let item = pool.acquire_within(Duration::from_secs(5)).await.unwrap();
    assert_eq!(*item, 1);
    assert_eq!(item.use_count(), 1);
    assert_eq!(pool.metrics().creation_failures, 3);
}

#[tokio::test]
async fn test_idle_items_expire() {
    let (factory, backend) = Connector::new();
    let config = PoolConfig::new("expiring", 1, 2).with_idle_timeout(Duration::from_millis(100));
    let pool = Pool::new(factory, config).unwrap();

    let item = pool.acquire().await.unwrap();
    let stale = item.item_id();
    drop(item);

    eventually(|| backend.destroyed.load(Ordering::SeqCst) >= 1).await;
    assert!(pool.metrics().disposed_idle_timeout >= 1);

    let item = pool.acquire_within(Duration::from_secs(2)).await.unwrap();
    assert_ne!(item.item_id(), stale);
    assert_eq!(item.use_count(), 1);
}

#[tokio::test]
async fn test_fresh_idle_item_is_reused() {
    let (factory, backend) = Connector::new();
    let config = PoolConfig::new("fresh", 1, 2).with_idle_timeout(Duration::from_secs(5));
    let pool = Pool::new(factory, config).unwrap();

    let item = pool.acquire().await.unwrap();
    let id = item.item_id();
    drop(item);

    let item = pool.acquire_within(Duration::from_secs(2)).await.unwrap();
    assert_eq!(item.item_id(), id);
    assert_eq!(item.use_count(), 2);
    assert_eq!(backend.destroyed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_release_into_full_idle_set_disposes_after_grace() {
    let (factory, backend) = Connector::new();
    let config =
        PoolConfig::new("overflow", 3, 1).with_release_grace(Duration::from_millis(100));
    let pool = Pool::new(factory, config).unwrap();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire_within(Duration::from_secs(2)).await.unwrap());
    }
    assert_eq!(pool.total_count(), 3);
    drop(held);

    eventually(|| {
        pool.total_count() == 1
            && pool.idle_count() == 1
            && pool.metrics().disposed_idle_full >= 2
    })
    .await;
    eventually(|| {
        backend.destroyed.load(Ordering::SeqCst) + 1 == backend.created.load(Ordering::SeqCst)
    })
    .await;

    let item = pool.acquire_within(Duration::from_secs(2)).await.unwrap();
    assert!(item.use_count() >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_never_share_an_item() {
    const MAX_TOTAL: usize = 4;

    let (factory, backend) = Connector::new();
    let pool = Arc::new(Pool::new(factory, PoolConfig::new("busy", MAX_TOTAL, MAX_TOTAL)).unwrap());
    let held = Arc::new(tracking::Held::default());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = Arc::clone(&pool);
        let held = Arc::clone(&held);
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                let item = pool.acquire_within(Duration::from_secs(10)).await.unwrap();
                held.enter(item.item_id(), MAX_TOTAL);
                assert!(pool.total_count() <= MAX_TOTAL);
                tokio::task::yield_now().await;
                held.leave(item.item_id());
                drop(item);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(backend.created.load(Ordering::SeqCst) <= MAX_TOTAL);
    assert_eq!(pool.metrics().total_acquired, 16 * 25);
    pool.close().await.unwrap();
    eventually(|| pool.total_count() == 0).await;
}

/// Tracks which items are checked out right now.
mod tracking {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Held(Mutex<HashSet<ItemId>>);

    impl Held {
        pub fn enter(&self, id: ItemId, max: usize) {
            let mut held = self.0.lock().unwrap();
            assert!(held.insert(id), "item {id} handed out twice");
            assert!(held.len() <= max);
        }

        pub fn leave(&self, id: ItemId) {
            self.0.lock().unwrap().remove(&id);
        }
    }
}

#[tokio::test]
async fn test_close_is_prompt_and_final() {
    let (factory, backend) = Connector::new();
    let pool = Pool::with_limits("closing", factory, 3, 3, Duration::ZERO).unwrap();

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    drop(a);
    eventually(|| pool.idle_count() >= 1).await;

    pool.close().await.unwrap();
    assert_eq!(pool.idle_count(), 0);
    drop(b);
    eventually(|| pool.total_count() == 0).await;
    eventually(|| backend.destroyed.load(Ordering::SeqCst) == backend.created.load(Ordering::SeqCst))
        .await;

    let started = Instant::now();
    assert!(matches!(pool.acquire().await, Err(PoolError::PoolClosed)));
    assert!(started.elapsed() < Duration::from_millis(100));
}
