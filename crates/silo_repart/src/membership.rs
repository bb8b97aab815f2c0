//! Cluster membership as seen by the repartitioner.
//!
//! Membership and failure detection are external concerns; this module only
//! defines the narrow oracle interface the engine consumes, plus a static
//! implementation for tests and the workload simulator.

use std::collections::BTreeMap;

use tokio::sync::watch;

use crate::ids::HostId;

/// Liveness of a cluster host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostStatus {
    Active,
    Stopping,
    Dead,
}

/// Point-in-time view of cluster membership.
#[derive(Clone, Debug, Default)]
pub struct MembershipSnapshot {
    pub version: u64,
    pub members: BTreeMap<HostId, HostStatus>,
}

impl MembershipSnapshot {
    pub fn active_hosts(&self) -> Vec<HostId> {
        self.members
            .iter()
            .filter_map(|(host, status)| (*status == HostStatus::Active).then_some(*host))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.members
            .values()
            .filter(|status| **status == HostStatus::Active)
            .count()
    }
}

/// Read-only membership oracle consumed by the engine and the tolerance rule.
pub trait MembershipOracle: Send + Sync {
    fn snapshot(&self) -> MembershipSnapshot;

    fn active_hosts(&self) -> Vec<HostId> {
        self.snapshot().active_hosts()
    }

    /// Change notifications; the receiver holds the latest snapshot.
    fn subscribe(&self) -> watch::Receiver<MembershipSnapshot>;
}

/// Membership fixed at construction and mutated explicitly, for tests and
/// simulations.
pub struct StaticMembership {
    state: watch::Sender<MembershipSnapshot>,
}

impl StaticMembership {
    pub fn new(hosts: impl IntoIterator<Item = HostId>) -> Self {
        let members = hosts
            .into_iter()
            .map(|host| (host, HostStatus::Active))
            .collect();
        let (state, _) = watch::channel(MembershipSnapshot {
            version: 1,
            members,
        });
        Self { state }
    }

    pub fn set_status(&self, host: HostId, status: HostStatus) {
        self.state.send_modify(|snapshot| {
            snapshot.version += 1;
            snapshot.members.insert(host, status);
        });
    }
}

impl MembershipOracle for StaticMembership {
    fn snapshot(&self) -> MembershipSnapshot {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<MembershipSnapshot> {
        self.state.subscribe()
    }
}
