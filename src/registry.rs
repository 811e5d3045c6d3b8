//! Bounded idle set shared by callers and the pool's background tasks

use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Returned when pulling from a closed registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Closed;

/// A rejected push, carrying the item back to the caller.
#[derive(Debug)]
pub(crate) enum PushError<T> {
    Full(T),
    Closed(T),
}

/// Bounded FIFO of idle items with async pull and deadline-bounded push.
///
/// Pushes hold a read lock on the closed flag across the enqueue, so once
/// [`close`](IdleRegistry::close) has drained the queue no item can land
/// in it again.
pub(crate) struct IdleRegistry<T> {
    queue: ArrayQueue<T>,
    closed: RwLock<bool>,
    pushed: Notify,
    popped: Notify,
}

impl<T> IdleRegistry<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            closed: RwLock::new(false),
            pushed: Notify::new(),
            popped: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    pub fn try_pull(&self) -> Result<Option<T>, Closed> {
        if self.is_closed() {
            return Err(Closed);
        }
        match self.queue.pop() {
            Some(item) => {
                self.popped.notify_one();
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Wait until an item is available or the registry closes.
    pub async fn pull(&self) -> Result<T, Closed> {
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pull()? {
                return Ok(item);
            }
            notified.await;
        }
    }

    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let closed = self.closed.read();
        if *closed {
            return Err(PushError::Closed(item));
        }
        self.queue.push(item).map_err(PushError::Full)?;
        drop(closed);
        self.pushed.notify_one();
        Ok(())
    }

    /// Push, waiting up to `grace` for room to free up.
    pub async fn push_within(&self, item: T, grace: Duration) -> Result<(), PushError<T>> {
        let deadline = Instant::now() + grace;
        let mut item = item;
        loop {
            let room = self.popped.notified();
            tokio::pin!(room);
            room.as_mut().enable();

            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(PushError::Full(back)) => item = back,
                Err(closed) => return Err(closed),
            }
            if tokio::time::timeout_at(deadline, room).await.is_err() {
                return Err(PushError::Full(item));
            }
        }
    }

    /// Close the registry and hand back everything still queued.
    ///
    /// Later calls return nothing.
    pub fn close(&self) -> Vec<T> {
        let mut drained = Vec::new();
        {
            let mut closed = self.closed.write();
            if *closed {
                return drained;
            }
            *closed = true;
            while let Some(item) = self.queue.pop() {
                drained.push(item);
            }
        }
        self.pushed.notify_waiters();
        self.popped.notify_waiters();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_try_push_rejects_when_full() {
        let registry = IdleRegistry::new(2);
        registry.try_push(1).unwrap();
        registry.try_push(2).unwrap();
        match registry.try_push(3) {
            Err(PushError::Full(v)) => assert_eq!(v, 3),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.try_pull(), Ok(Some(1)));
    }

    #[tokio::test]
    async fn test_pull_waits_for_push() {
        let registry = Arc::new(IdleRegistry::new(1));
        let pusher = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.try_push(7).unwrap();
        });
        let got = tokio::time::timeout(Duration::from_secs(2), registry.pull())
            .await
            .unwrap();
        assert_eq!(got, Ok(7));
    }

    #[tokio::test]
    async fn test_push_within_times_out_when_full() {
        let registry = IdleRegistry::new(1);
        registry.try_push(1).unwrap();
        let started = std::time::Instant::now();
        match registry.push_within(2, Duration::from_millis(50)).await {
            Err(PushError::Full(v)) => assert_eq!(v, 2),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_push_within_succeeds_once_room_frees() {
        let registry = Arc::new(IdleRegistry::new(1));
        registry.try_push(1).unwrap();
        let puller = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            puller.try_pull().unwrap();
        });
        registry
            .push_within(2, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(registry.try_pull(), Ok(Some(2)));
    }

    #[tokio::test]
    async fn test_close_drains_and_rejects() {
        let registry = Arc::new(IdleRegistry::new(4));
        registry.try_push(1).unwrap();
        registry.try_push(2).unwrap();

        let waiter = {
            let registry = Arc::new(IdleRegistry::<i32>::new(1));
            let r = Arc::clone(&registry);
            let handle = tokio::spawn(async move { r.pull().await });
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(registry.close().is_empty());
            handle
        };
        assert_eq!(waiter.await.unwrap(), Err(Closed));

        assert_eq!(registry.close(), vec![1, 2]);
        assert!(registry.close().is_empty());
        assert!(registry.is_closed());
        assert_eq!(registry.try_pull(), Err(Closed));
        assert!(matches!(registry.try_push(3), Err(PushError::Closed(3))));
        assert_eq!(registry.pull().await, Err(Closed));
    }
}
