//! Pool configuration options

use std::time::Duration;

use crate::errors::{PoolError, PoolResult};

/// Configuration for pool behavior
///
/// # Examples
///
/// ```
/// use reservoir::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::new("db", 8, 8)
///     .with_idle_timeout(Duration::from_secs(60))
///     .with_acquire_timeout(Duration::from_secs(5));
///
/// assert_eq!(config.max_total, 8);
/// assert_eq!(config.idle_timeout, Some(Duration::from_secs(60)));
///
/// // Equal limits leave no room to return the last item, so idle is bumped.
/// assert_eq!(config.normalized().max_idle, 9);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Name used in logs and metrics
    pub name: String,

    /// Maximum number of items alive at once, idle and checked out together
    pub max_total: usize,

    /// Maximum number of idle items held by the pool
    pub max_idle: usize,

    /// Idle items older than this are disposed; `None` disables expiry
    pub idle_timeout: Option<Duration>,

    /// Upper bound on how long `acquire` waits; `None` waits forever
    pub acquire_timeout: Option<Duration>,

    /// How long a release may wait for room in the idle set
    pub release_grace: Duration,

    /// Pause before retrying creation when the pool has no items at all
    pub replenish_cooldown: Duration,

    /// Upper bound on the reaper's pause between idle checks
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            max_total: 10,
            max_idle: 10,
            idle_timeout: None,
            acquire_timeout: None,
            release_grace: Duration::from_secs(10),
            replenish_cooldown: Duration::from_secs(2),
            reap_interval: Duration::from_secs(10),
        }
    }
}

/// Zero durations mean "no timeout".
fn non_zero(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

impl PoolConfig {
    /// Create a configuration with the given name and limits
    pub fn new(name: impl Into<String>, max_total: usize, max_idle: usize) -> Self {
        Self {
            name: name.into(),
            max_total,
            max_idle,
            ..Self::default()
        }
    }

    /// Set the idle timeout; `Duration::ZERO` disables it
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = non_zero(timeout);
        self
    }

    /// Set the acquire timeout; `Duration::ZERO` disables it
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = non_zero(timeout);
        self
    }

    /// Set the grace period a release waits for room in the idle set
    pub fn with_release_grace(mut self, grace: Duration) -> Self {
        self.release_grace = grace;
        self
    }

    /// Set the cooldown applied after a creation failure on an empty pool
    pub fn with_replenish_cooldown(mut self, cooldown: Duration) -> Self {
        self.replenish_cooldown = cooldown;
        self
    }

    /// Cap the reaper's pause between idle checks
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Check the limits for values the pool cannot run with
    ///
    /// # Examples
    ///
    /// ```
    /// use reservoir::PoolConfig;
    ///
    /// assert!(PoolConfig::new("db", 4, 5).validate().is_ok());
    /// assert!(PoolConfig::new("db", 0, 5).validate().is_err());
    /// ```
    pub fn validate(&self) -> PoolResult<()> {
        if self.name.is_empty() {
            return Err(PoolError::InvalidConfig("name must not be empty".into()));
        }
        if self.max_total == 0 {
            return Err(PoolError::InvalidConfig("max_total must be positive".into()));
        }
        if self.max_idle == 0 {
            return Err(PoolError::InvalidConfig("max_idle must be positive".into()));
        }
        Ok(())
    }

    /// Return a copy with `max_idle` raised past `max_total` when both are equal.
    ///
    /// With equal limits, once every item is checked out and then returned
    /// the last one would find the idle set full and be disposed.
    pub fn normalized(mut self) -> Self {
        if self.max_idle == self.max_total {
            self.max_idle = self.max_total + 1;
        }
        self.idle_timeout = self.idle_timeout.and_then(non_zero);
        self.acquire_timeout = self.acquire_timeout.and_then(non_zero);
        self
    }
}
