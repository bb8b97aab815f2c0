//! Allowed activation-count imbalance between exchange partners.

use tokio::sync::watch;

use crate::membership::{MembershipOracle, MembershipSnapshot};

/// Decides how much pairwise activation-count imbalance an exchange may
/// leave behind.
pub trait ImbalanceToleranceRule: Send + Sync {
    fn is_satisfied_by(&self, imbalance: u64) -> bool;
}

/// Baseline allowed imbalance for the smallest clusters.
const BASELINE: f64 = 10.0;
/// Percentage floor: large clusters never drop below this share of baseline.
const FLOOR_PERCENT: f64 = 10.0;
/// Steepness of the decay as the cluster grows.
const SIGMOID_SLOPE: f64 = 0.07;
/// Host count at which tolerance has decayed to half the baseline.
const SIGMOID_MIDPOINT: f64 = 50.0;

/// Inverted-sigmoid tolerance over active-host count.
///
/// Tolerance shrinks as the cluster grows, bottoming out at a floor; when an
/// external cluster-wide rebalancer reports an imbalance figure in [0, 1],
/// the tolerance is scaled down by `cos(pi * imbalance / 2)` so a skewed
/// cluster converges more aggressively.
pub struct DefaultImbalanceRule {
    membership: watch::Receiver<MembershipSnapshot>,
    cluster_imbalance: Option<watch::Receiver<f64>>,
}

impl DefaultImbalanceRule {
    pub fn new(membership: &dyn MembershipOracle) -> Self {
        Self {
            membership: membership.subscribe(),
            cluster_imbalance: None,
        }
    }

    /// Attaches the optional cluster-wide imbalance feed.
    pub fn with_imbalance_feed(mut self, feed: watch::Receiver<f64>) -> Self {
        self.cluster_imbalance = Some(feed);
        self
    }

    fn allowed(&self) -> f64 {
        let active_hosts = self.membership.borrow().active_count();
        let mut allowed = allowed_imbalance(active_hosts);
        if let Some(feed) = &self.cluster_imbalance {
            let imbalance = feed.borrow().clamp(0.0, 1.0);
            allowed *= (core::f64::consts::PI * imbalance / 2.0).cos();
        }
        allowed
    }
}

impl ImbalanceToleranceRule for DefaultImbalanceRule {
    fn is_satisfied_by(&self, imbalance: u64) -> bool {
        imbalance as f64 <= self.allowed()
    }
}

fn allowed_imbalance(active_hosts: usize) -> f64 {
    let x = active_hosts as f64;
    let percent = 100.0 / (1.0 + (SIGMOID_SLOPE * (x - SIGMOID_MIDPOINT)).exp());
    (BASELINE * percent.max(FLOOR_PERCENT) / 100.0).round()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::HostId;
    use crate::membership::{HostStatus, StaticMembership};

    #[test]
    fn tolerance_is_non_increasing_in_cluster_size() {
        let mut previous = f64::INFINITY;
        for hosts in 2..=512 {
            let allowed = allowed_imbalance(hosts);
            assert!(
                allowed <= previous,
                "tolerance grew from {previous} to {allowed} at {hosts} hosts"
            );
            previous = allowed;
        }
    }

    #[test]
    fn tolerance_has_a_floor() {
        assert!(allowed_imbalance(10_000) >= 1.0);
    }

    #[test]
    fn small_clusters_get_close_to_baseline() {
        assert_eq!(allowed_imbalance(2), BASELINE);
    }

    #[test]
    fn rule_tracks_membership_changes() {
        let membership = StaticMembership::new((1..=2).map(HostId));
        let rule = DefaultImbalanceRule::new(&membership);
        assert!(rule.is_satisfied_by(10));
        assert!(!rule.is_satisfied_by(11));

        for host in 3..=200 {
            membership.set_status(HostId(host), HostStatus::Active);
        }
        // A 200-host cluster sits on the floor: 10% of baseline.
        assert!(rule.is_satisfied_by(1));
        assert!(!rule.is_satisfied_by(2));
    }

    #[test]
    fn cluster_imbalance_feed_scales_tolerance_down() {
        let membership = StaticMembership::new((1..=2).map(HostId));
        let (tx, rx) = tokio::sync::watch::channel(0.0f64);
        let rule = DefaultImbalanceRule::new(&membership).with_imbalance_feed(rx);

        assert!(rule.is_satisfied_by(10));

        // A fully imbalanced cluster tolerates nothing.
        tx.send(1.0).unwrap();
        assert!(rule.is_satisfied_by(0));
        assert!(!rule.is_satisfied_by(1));

        // A halfway signal scales by cos(pi/4).
        tx.send(0.5).unwrap();
        assert!(rule.is_satisfied_by(7));
        assert!(!rule.is_satisfied_by(8));
    }
}
