//! Runtime configuration for the repartitioning engine.

use std::time::Duration;

/// Tunables recognized by the repartitioner.
#[derive(Clone, Copy, Debug)]
pub struct RepartitionerOptions {
    /// Lower bound of the randomized per-round period.
    pub min_round_period: Duration,
    /// Upper bound of the randomized per-round period.
    pub max_round_period: Duration,
    /// Cooldown after a completed exchange during which this host neither
    /// initiates nor accepts another one.
    pub recovery_period: Duration,
    /// Capacity of the frequency sketch (tracked edges).
    pub max_edge_count: usize,
    /// Capacity of the ingestion buffer, summed across all stripes. Samples
    /// beyond this are dropped rather than blocking the send path.
    pub max_unprocessed_edges: usize,
    /// Whether anchored units are remembered in a probabilistic filter.
    pub anchoring_filter_enabled: bool,
    /// Expected number of distinct anchored units the filter is sized for.
    pub anchoring_filter_capacity: usize,
    /// Highest tolerated false-positive rate of the anchoring filter.
    pub probabilistic_filtering_max_allowed_error_rate: f64,
}

impl Default for RepartitionerOptions {
    fn default() -> Self {
        Self {
            min_round_period: Duration::from_secs(60),
            max_round_period: Duration::from_secs(120),
            recovery_period: Duration::from_secs(60),
            max_edge_count: 10_000,
            max_unprocessed_edges: 100_000,
            anchoring_filter_enabled: true,
            anchoring_filter_capacity: 100_000,
            probabilistic_filtering_max_allowed_error_rate: 0.01,
        }
    }
}

impl RepartitionerOptions {
    /// Validates the option set, failing fast on construction-time errors.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_round_period.is_zero() {
            anyhow::bail!("min_round_period must be greater than zero");
        }
        if self.max_round_period < self.min_round_period {
            anyhow::bail!(
                "max_round_period ({:?}) must be at least min_round_period ({:?})",
                self.max_round_period,
                self.min_round_period
            );
        }
        if self.recovery_period > self.min_round_period {
            anyhow::bail!(
                "recovery_period ({:?}) must not exceed min_round_period ({:?})",
                self.recovery_period,
                self.min_round_period
            );
        }
        if self.max_edge_count == 0 {
            anyhow::bail!("max_edge_count must be greater than zero");
        }
        if self.max_unprocessed_edges == 0 {
            anyhow::bail!("max_unprocessed_edges must be greater than zero");
        }
        if self.anchoring_filter_enabled && self.anchoring_filter_capacity == 0 {
            anyhow::bail!("anchoring_filter_capacity must be greater than zero");
        }
        Ok(())
    }
}
