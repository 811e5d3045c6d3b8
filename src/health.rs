//! Health monitoring for pools

/// Health status of a pool
///
/// # Examples
///
/// ```
/// use reservoir::HealthStatus;
///
/// let health = HealthStatus::new(2, 3, 10, false);
/// assert!(health.is_healthy());
/// assert_eq!(health.busy_items, 1);
///
/// let closed = HealthStatus::new(0, 0, 10, true);
/// assert!(!closed.is_healthy());
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Share of the total capacity in use (0.0 to 1.0)
    pub utilization: f64,

    /// Idle items
    pub idle_items: usize,

    /// Items checked out or being created
    pub busy_items: usize,

    /// Maximum total items
    pub max_total: usize,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    /// Create a new health status
    pub fn new(idle: usize, total: usize, max_total: usize, closed: bool) -> Self {
        let utilization = if max_total > 0 {
            total as f64 / max_total as f64
        } else {
            0.0
        };

        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if closed {
            warnings.push("Pool is closed".to_string());
            is_healthy = false;
        }

        if utilization > 0.9 && idle == 0 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        if idle == 0 && !closed {
            warnings.push("No idle items".to_string());
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization,
            idle_items: idle,
            busy_items: total.saturating_sub(idle),
            max_total,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_pool_is_unhealthy() {
        let health = HealthStatus::new(0, 4, 4, false);
        assert!(!health.is_healthy());
        assert_eq!(health.warning_count, 2);
        assert_eq!(health.busy_items, 4);
    }

    #[test]
    fn test_full_but_idle_pool_is_healthy() {
        let health = HealthStatus::new(4, 4, 4, false);
        assert!(health.is_healthy());
        assert!(health.warnings.is_empty());
    }
}
