//! Activation placement boundary.
//!
//! The real placement, activation, and deactivation machinery lives outside
//! this crate; the engine only needs to know how many activations a host
//! carries, whether a unit is local, and how to hint a migration and wait
//! for the local activation to wind down. `InMemoryCluster` implements both
//! sides for tests and the workload simulator.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::ids::{HostId, UnitId};

/// Local activation directory of a host.
pub trait ActivationDirectory: Send + Sync {
    /// Number of activations currently hosted locally.
    fn activation_count(&self) -> usize;

    /// Whether `unit` is currently activated on this host.
    fn contains(&self, unit: UnitId) -> bool;
}

/// Migration side of the placement subsystem.
#[async_trait]
pub trait MigrationManager: Send + Sync {
    /// Hints placement to move `unit` to `target` and resolves once the
    /// local activation has deactivated.
    async fn migrate(&self, unit: UnitId, target: HostId) -> anyhow::Result<()>;
}

/// Shared placement table backing every host of an in-process cluster.
#[derive(Default)]
pub struct InMemoryCluster {
    placements: RwLock<HashMap<UnitId, HostId>>,
    /// Units whose migration is made to fail, for fault-injection tests.
    poisoned: RwLock<HashSet<UnitId>>,
    migrations: AtomicU64,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn place(&self, unit: UnitId, host: HostId) {
        self.placements
            .write()
            .expect("placements lock poisoned")
            .insert(unit, host);
    }

    pub fn host_of(&self, unit: UnitId) -> Option<HostId> {
        self.placements
            .read()
            .expect("placements lock poisoned")
            .get(&unit)
            .copied()
    }

    pub fn count_on(&self, host: HostId) -> usize {
        self.placements
            .read()
            .expect("placements lock poisoned")
            .values()
            .filter(|placed| **placed == host)
            .count()
    }

    pub fn total_units(&self) -> usize {
        self.placements.read().expect("placements lock poisoned").len()
    }

    /// Completed migrations across the whole cluster.
    pub fn migration_count(&self) -> u64 {
        self.migrations.load(Ordering::Relaxed)
    }

    /// Makes every future migration of `unit` fail.
    pub fn poison(&self, unit: UnitId) {
        self.poisoned
            .write()
            .expect("poisoned lock poisoned")
            .insert(unit);
    }

    /// Directory view of a single host.
    pub fn directory(self: &Arc<Self>, host: HostId) -> Arc<dyn ActivationDirectory> {
        Arc::new(HostView {
            cluster: Arc::clone(self),
            host,
        })
    }

    /// Migration manager view of a single host.
    pub fn migrator(self: &Arc<Self>, host: HostId) -> Arc<dyn MigrationManager> {
        Arc::new(HostView {
            cluster: Arc::clone(self),
            host,
        })
    }
}

struct HostView {
    cluster: Arc<InMemoryCluster>,
    host: HostId,
}

impl ActivationDirectory for HostView {
    fn activation_count(&self) -> usize {
        self.cluster.count_on(self.host)
    }

    fn contains(&self, unit: UnitId) -> bool {
        self.cluster.host_of(unit) == Some(self.host)
    }
}

#[async_trait]
impl MigrationManager for HostView {
    async fn migrate(&self, unit: UnitId, target: HostId) -> anyhow::Result<()> {
        if self
            .cluster
            .poisoned
            .read()
            .expect("poisoned lock poisoned")
            .contains(&unit)
        {
            anyhow::bail!("injected migration failure for {unit}");
        }
        let mut placements = self
            .cluster
            .placements
            .write()
            .expect("placements lock poisoned");
        let current = placements.get(&unit).copied();
        match current {
            Some(host) if host == self.host => {
                placements.insert(unit, target);
                self.cluster.migrations.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            other => anyhow::bail!(
                "{unit} is not activated on {} (currently {:?})",
                self.host,
                other
            ),
        }
    }
}
