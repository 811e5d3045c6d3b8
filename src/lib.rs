//! # reservoir
//!
//! Async, concurrency-safe pool for expensive, reusable resources such as
//! network connections, buffers or worker handles.
//!
//! ## Features
//!
//! - Lazy creation of items by a background task, bounded by a total count
//! - Bounded idle set with a grace period on release
//! - Idle expiry enforced both on checkout and by a background reaper
//! - Bounded-wait acquisition
//! - Error-triggered disposal with automatic replacement
//! - Automatic return of resources via RAII (Drop trait)
//! - Graceful, idempotent shutdown
//! - Metrics, Prometheus export and health status
//!
//! ## Quick Start
//!
//! ```rust
//! use reservoir::{Factory, Pool, PoolConfig, async_trait};
//! use std::time::Duration;
//!
//! struct Counter;
//!
//! #[async_trait]
//! impl Factory for Counter {
//!     type Resource = u64;
//!     type Error = std::io::Error;
//!
//!     async fn create(&self) -> Result<u64, Self::Error> {
//!         Ok(0)
//!     }
//! }
//!
//! # #[tokio::main] async fn main() {
//! let config = PoolConfig::new("counters", 4, 4)
//!     .with_acquire_timeout(Duration::from_secs(1));
//! let pool = Pool::new(Counter, config).unwrap();
//! {
//!     let mut n = pool.acquire().await.unwrap();
//!     *n += 1;
//!     // Resource automatically returned when `n` goes out of scope
//! }
//! pool.close().await.unwrap();
//! # }
//! ```

mod config;
mod errors;
mod eviction;
mod factory;
mod health;
mod item;
mod metrics;
mod pool;
mod registry;
mod replenish;

pub use async_trait::async_trait;
pub use config::PoolConfig;
pub use errors::{PoolError, PoolResult, SharedError};
pub use factory::Factory;
pub use health::HealthStatus;
pub use item::ItemId;
#[cfg(feature = "metrics")]
pub use metrics::PoolCollector;
pub use metrics::{MetricsExporter, PoolMetrics};
pub use pool::{Pool, Pooled};
