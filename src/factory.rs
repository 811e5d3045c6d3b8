//! The contract between the pool and the owner of the pooled resource

use async_trait::async_trait;

/// Creates, prepares and tears down the resources held by a [`Pool`](crate::Pool).
///
/// The pool calls [`create`](Factory::create) from a background task
/// whenever it has room for another item, and
/// [`initialize`](Factory::initialize) every time an item is about to be
/// handed to a caller.
///
/// # Examples
///
/// ```
/// use reservoir::Factory;
/// use reservoir::async_trait;
///
/// struct Buffers;
///
/// #[async_trait]
/// impl Factory for Buffers {
///     type Resource = Vec<u8>;
///     type Error = std::io::Error;
///
///     async fn create(&self) -> Result<Vec<u8>, Self::Error> {
///         Ok(Vec::with_capacity(4096))
///     }
///
///     async fn initialize(&self, buf: &mut Vec<u8>, _use_count: u64) -> Result<(), Self::Error> {
///         buf.clear();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Factory: Send + Sync + 'static {
    /// The pooled value.
    type Resource: Send + 'static;

    /// Error returned by the factory operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Build a new resource. Only called when the pool has capacity for it.
    async fn create(&self) -> Result<Self::Resource, Self::Error>;

    /// Prepare a resource before it is handed out.
    ///
    /// `use_count` is 1 the first time the resource is handed out. A
    /// failure disposes the resource and the pool tries another one.
    async fn initialize(
        &self,
        _resource: &mut Self::Resource,
        _use_count: u64,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Tear down a resource that leaves the pool for good.
    ///
    /// Runs at most once per resource.
    async fn destroy(&self, resource: Self::Resource) {
        drop(resource);
    }

    /// Called once when the pool closes, after the idle items are disposed.
    async fn shutdown(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}
