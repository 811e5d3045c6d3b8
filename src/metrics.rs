//! Metrics collection and export for pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::PoolError;

/// Metrics data for a pool
///
/// # Examples
///
/// ```
/// use reservoir::{Factory, Pool, PoolConfig, async_trait};
///
/// struct Numbers;
///
/// #[async_trait]
/// impl Factory for Numbers {
///     type Resource = u32;
///     type Error = std::io::Error;
///     async fn create(&self) -> Result<u32, Self::Error> { Ok(7) }
/// }
///
/// # #[tokio::main] async fn main() {
/// let pool = Pool::new(Numbers, PoolConfig::new("numbers", 2, 3)).unwrap();
/// let item = pool.acquire().await.unwrap();
/// let metrics = pool.metrics();
/// assert_eq!(metrics.total_acquired, 1);
/// assert!(metrics.items_created >= 1);
/// # drop(item);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Items built by the factory
    pub items_created: u64,

    /// Failed or panicked factory creations
    pub creation_failures: u64,

    /// Successful acquisitions
    pub total_acquired: u64,

    /// Items put back into the idle set
    pub total_released: u64,

    /// Acquisitions that ran out of time
    pub acquire_timeouts: u64,

    /// Items disposed after sitting idle too long
    pub disposed_idle_timeout: u64,

    /// Items disposed because the idle set had no room
    pub disposed_idle_full: u64,

    /// Items disposed by pool shutdown
    pub disposed_closed: u64,

    /// Items disposed because of a factory, holder or discard error
    pub disposed_error: u64,

    /// Items taken out of the pool for good by their holder
    pub detached: u64,

    /// Items currently alive, idle or checked out
    pub total_items: usize,

    /// Items currently idle
    pub idle_items: usize,

    /// Maximum total items
    pub max_total: usize,

    /// Pool utilization ratio (0.0 to 1.0)
    pub utilization: f64,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("items_created".to_string(), self.items_created.to_string());
        metrics.insert("creation_failures".to_string(), self.creation_failures.to_string());
        metrics.insert("total_acquired".to_string(), self.total_acquired.to_string());
        metrics.insert("total_released".to_string(), self.total_released.to_string());
        metrics.insert("acquire_timeouts".to_string(), self.acquire_timeouts.to_string());
        metrics.insert("disposed_idle_timeout".to_string(), self.disposed_idle_timeout.to_string());
        metrics.insert("disposed_idle_full".to_string(), self.disposed_idle_full.to_string());
        metrics.insert("disposed_closed".to_string(), self.disposed_closed.to_string());
        metrics.insert("disposed_error".to_string(), self.disposed_error.to_string());
        metrics.insert("detached".to_string(), self.detached.to_string());
        metrics.insert("total_items".to_string(), self.total_items.to_string());
        metrics.insert("idle_items".to_string(), self.idle_items.to_string());
        metrics.insert("max_total".to_string(), self.max_total.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics
    }

    /// Items currently checked out (or being created).
    pub fn busy_items(&self) -> usize {
        self.total_items.saturating_sub(self.idle_items)
    }
}

/// Metrics exporter for Prometheus format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        let gauges = [
            ("reservoir_items_total", "Items alive, idle or checked out", metrics.total_items as u64),
            ("reservoir_items_idle", "Items currently idle", metrics.idle_items as u64),
            ("reservoir_items_max", "Maximum total items", metrics.max_total as u64),
        ];
        for (name, help, value) in gauges {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} gauge\n"));
            output.push_str(&format!("{name}{{{labels}}} {value}\n"));
        }

        output.push_str("# HELP reservoir_utilization Pool utilization ratio\n");
        output.push_str("# TYPE reservoir_utilization gauge\n");
        output.push_str(&format!("reservoir_utilization{{{}}} {:.2}\n", labels, metrics.utilization));

        let counters = [
            ("reservoir_items_created_total", "Items built by the factory", metrics.items_created),
            ("reservoir_creation_failures_total", "Failed item creations", metrics.creation_failures),
            ("reservoir_acquired_total", "Successful acquisitions", metrics.total_acquired),
            ("reservoir_released_total", "Items returned to the idle set", metrics.total_released),
            ("reservoir_acquire_timeouts_total", "Acquisitions that timed out", metrics.acquire_timeouts),
            ("reservoir_detached_total", "Items taken out of the pool", metrics.detached),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name}{{{labels}}} {value}\n"));
        }

        output.push_str("# HELP reservoir_disposed_total Items disposed, by reason\n");
        output.push_str("# TYPE reservoir_disposed_total counter\n");
        for (reason, value) in metrics.disposals() {
            output.push_str(&format!(
                "reservoir_disposed_total{{{labels},reason=\"{reason}\"}} {value}\n"
            ));
        }

        output
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut tags: Vec<_> = tags.iter().collect();
            tags.sort();
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

impl PoolMetrics {
    fn disposals(&self) -> [(&'static str, u64); 4] {
        [
            ("idle_timeout", self.disposed_idle_timeout),
            ("idle_full", self.disposed_idle_full),
            ("closed", self.disposed_closed),
            ("error", self.disposed_error),
        ]
    }
}

/// Internal metrics tracker
#[derive(Debug, Default)]
pub(crate) struct MetricsTracker {
    pub items_created: AtomicU64,
    pub creation_failures: AtomicU64,
    pub total_acquired: AtomicU64,
    pub total_released: AtomicU64,
    pub acquire_timeouts: AtomicU64,
    disposed_idle_timeout: AtomicU64,
    disposed_idle_full: AtomicU64,
    disposed_closed: AtomicU64,
    disposed_error: AtomicU64,
    pub detached: AtomicU64,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disposal(&self, reason: &PoolError) {
        let counter = match reason {
            PoolError::IdleTimeout => &self.disposed_idle_timeout,
            PoolError::IdleFull => &self.disposed_idle_full,
            PoolError::PoolClosed => &self.disposed_closed,
            _ => &self.disposed_error,
        };
        Self::incr(counter);
    }

    pub fn get_metrics(&self, total: usize, idle: usize, max_total: usize) -> PoolMetrics {
        let utilization = if max_total > 0 {
            total as f64 / max_total as f64
        } else {
            0.0
        };

        PoolMetrics {
            items_created: self.items_created.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            disposed_idle_timeout: self.disposed_idle_timeout.load(Ordering::Relaxed),
            disposed_idle_full: self.disposed_idle_full.load(Ordering::Relaxed),
            disposed_closed: self.disposed_closed.load(Ordering::Relaxed),
            disposed_error: self.disposed_error.load(Ordering::Relaxed),
            detached: self.detached.load(Ordering::Relaxed),
            total_items: total,
            idle_items: idle,
            max_total,
            utilization,
        }
    }
}

#[cfg(feature = "metrics")]
pub use collector::PoolCollector;

#[cfg(feature = "metrics")]
mod collector {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use prometheus::core::{Collector, Desc};
    use prometheus::proto::MetricFamily;
    use prometheus::{IntCounter, IntGauge, Opts};

    use super::PoolMetrics;

    pub(crate) type Snapshot = Arc<dyn Fn() -> Option<PoolMetrics> + Send + Sync>;

    /// A [`prometheus`] collector reading a pool's live metrics on every scrape.
    ///
    /// Obtained from [`Pool::collector`](crate::Pool::collector) and
    /// registered with a [`prometheus::Registry`].
    pub struct PoolCollector {
        snapshot: Snapshot,
        total: IntGauge,
        idle: IntGauge,
        max_total: IntGauge,
        created: IntCounter,
        creation_failures: IntCounter,
        acquired: IntCounter,
        released: IntCounter,
        acquire_timeouts: IntCounter,
        detached: IntCounter,
        disposed: IntCounter,
        sync: Mutex<()>,
    }

    impl PoolCollector {
        pub(crate) fn new(pool_name: &str, snapshot: Snapshot) -> prometheus::Result<Self> {
            let gauge = |name: &str, help: &str| {
                IntGauge::with_opts(Opts::new(name, help).const_label("pool", pool_name))
            };
            let counter = |name: &str, help: &str| {
                IntCounter::with_opts(Opts::new(name, help).const_label("pool", pool_name))
            };
            Ok(Self {
                snapshot,
                total: gauge("reservoir_items_total", "Items alive, idle or checked out")?,
                idle: gauge("reservoir_items_idle", "Items currently idle")?,
                max_total: gauge("reservoir_items_max", "Maximum total items")?,
                created: counter("reservoir_items_created_total", "Items built by the factory")?,
                creation_failures: counter(
                    "reservoir_creation_failures_total",
                    "Failed item creations",
                )?,
                acquired: counter("reservoir_acquired_total", "Successful acquisitions")?,
                released: counter("reservoir_released_total", "Items returned to the idle set")?,
                acquire_timeouts: counter(
                    "reservoir_acquire_timeouts_total",
                    "Acquisitions that timed out",
                )?,
                detached: counter("reservoir_detached_total", "Items taken out of the pool")?,
                disposed: counter("reservoir_disposed_total", "Items disposed")?,
                sync: Mutex::new(()),
            })
        }

        fn gauges(&self) -> [&IntGauge; 3] {
            [&self.total, &self.idle, &self.max_total]
        }

        fn counters(&self) -> [&IntCounter; 7] {
            [
                &self.created,
                &self.creation_failures,
                &self.acquired,
                &self.released,
                &self.acquire_timeouts,
                &self.detached,
                &self.disposed,
            ]
        }

        fn refresh(&self, metrics: &PoolMetrics) {
            self.total.set(metrics.total_items as i64);
            self.idle.set(metrics.idle_items as i64);
            self.max_total.set(metrics.max_total as i64);

            let disposed = metrics.disposals().iter().map(|(_, v)| v).sum::<u64>();
            let targets = [
                metrics.items_created,
                metrics.creation_failures,
                metrics.total_acquired,
                metrics.total_released,
                metrics.acquire_timeouts,
                metrics.detached,
                disposed,
            ];
            for (counter, target) in self.counters().into_iter().zip(targets) {
                let seen = counter.get();
                if target > seen {
                    counter.inc_by(target - seen);
                }
            }
        }
    }

    impl Collector for PoolCollector {
        fn desc(&self) -> Vec<&Desc> {
            let mut descs = Vec::new();
            for gauge in self.gauges() {
                descs.extend(gauge.desc());
            }
            for counter in self.counters() {
                descs.extend(counter.desc());
            }
            descs
        }

        fn collect(&self) -> Vec<MetricFamily> {
            let _guard = self.sync.lock();
            if let Some(metrics) = (self.snapshot)() {
                self.refresh(&metrics);
            }
            let mut families = Vec::new();
            for gauge in self.gauges() {
                families.extend(gauge.collect());
            }
            for counter in self.counters() {
                families.extend(counter.collect());
            }
            families
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposals_are_bucketed_by_reason() {
        let tracker = MetricsTracker::new();
        tracker.record_disposal(&PoolError::IdleTimeout);
        tracker.record_disposal(&PoolError::IdleTimeout);
        tracker.record_disposal(&PoolError::PoolClosed);
        tracker.record_disposal(&PoolError::Discarded);

        let metrics = tracker.get_metrics(3, 1, 4);
        assert_eq!(metrics.disposed_idle_timeout, 2);
        assert_eq!(metrics.disposed_closed, 1);
        assert_eq!(metrics.disposed_error, 1);
        assert_eq!(metrics.disposed_idle_full, 0);
        assert_eq!(metrics.busy_items(), 2);
        assert!((metrics.utilization - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_prometheus_text_has_labels() {
        let tracker = MetricsTracker::new();
        MetricsTracker::incr(&tracker.items_created);
        let metrics = tracker.get_metrics(1, 1, 2);

        let mut tags = HashMap::new();
        tags.insert("service".to_string(), "api".to_string());
        let output = MetricsExporter::export_prometheus(&metrics, "db", Some(&tags));

        assert!(output.contains("reservoir_items_total{pool=\"db\",service=\"api\"} 1"));
        assert!(output.contains("reservoir_items_created_total{pool=\"db\",service=\"api\"} 1"));
        assert!(output.contains("reason=\"idle_timeout\"} 0"));
    }

    #[test]
    fn test_export_map() {
        let metrics = MetricsTracker::new().get_metrics(0, 0, 5);
        let map = metrics.export();
        assert_eq!(map["max_total"], "5");
        assert_eq!(map["utilization"], "0.00");
        assert_eq!(map["detached"], "0");
    }
}
