//! Error types for the pool

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Shared, cloneable boxed error used for factory and holder failures.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("the pool is closed")]
    PoolClosed,

    #[error("the item exceeded its idle timeout")]
    IdleTimeout,

    #[error("idle items are full")]
    IdleFull,

    #[error("no item available within {0:?}")]
    GetTimeout(Duration),

    #[error("factory error: {0}")]
    Factory(SharedError),

    #[error("resource error: {0}")]
    Resource(SharedError),

    #[error("item was discarded by its holder")]
    Discarded,

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Wrap an error returned by a [`Factory`](crate::Factory).
    pub fn factory<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        PoolError::Factory(Arc::new(err))
    }

    /// Wrap an error observed by the holder of a pooled resource.
    pub fn resource<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        PoolError::Resource(Arc::from(err.into()))
    }

    pub(crate) fn factory_panic(msg: &str) -> Self {
        let err: Box<dyn StdError + Send + Sync> =
            format!("factory panicked: {msg}").into();
        PoolError::Factory(Arc::from(err))
    }

    /// Whether this error marks a routine, pool-internal disposal.
    ///
    /// Disposals for these reasons do not ask the pool to build a
    /// replacement item.
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self,
            PoolError::PoolClosed | PoolError::IdleFull | PoolError::IdleTimeout
        )
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
