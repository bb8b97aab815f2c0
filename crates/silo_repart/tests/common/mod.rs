//! Shared harness assembling in-process clusters for protocol tests.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use silo_repart::directory::InMemoryCluster;
use silo_repart::membership::StaticMembership;
use silo_repart::sampler::{SampledMessage, TypeMovabilityFilter};
use silo_repart::tolerance::DefaultImbalanceRule;
use silo_repart::transport::InProcessTransport;
use silo_repart::{
    spawn, HostId, HostRuntime, RepartitionerHandle, RepartitionerOptions, UnitId,
};

/// Type id registered as immovable with the message filter.
pub const IMMOVABLE_TYPE: u32 = 99;
/// Default movable unit type.
pub const UNIT_TYPE: u32 = 1;

/// Options for manually driven tests: timers effectively never fire and a
/// long cooldown keeps a second exchange from sneaking in.
pub fn manual_options() -> RepartitionerOptions {
    RepartitionerOptions {
        min_round_period: Duration::from_secs(300),
        max_round_period: Duration::from_secs(600),
        recovery_period: Duration::from_secs(300),
        max_unprocessed_edges: 1_000_000,
        ..Default::default()
    }
}

/// Same, but with a negligible cooldown so tests can run several rounds.
pub fn multi_round_options() -> RepartitionerOptions {
    RepartitionerOptions {
        recovery_period: Duration::from_millis(1),
        ..manual_options()
    }
}

pub struct TestCluster {
    pub membership: Arc<StaticMembership>,
    pub placement: Arc<InMemoryCluster>,
    pub handles: Vec<RepartitionerHandle>,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl TestCluster {
    pub async fn start(hosts: u64, options: RepartitionerOptions) -> Self {
        let membership = Arc::new(StaticMembership::new((1..=hosts).map(HostId)));
        let placement = InMemoryCluster::new();
        let transport = Arc::new(InProcessTransport::new(Duration::from_secs(10)));
        let filter = Arc::new(TypeMovabilityFilter::new([IMMOVABLE_TYPE]));
        let shutdown = CancellationToken::new();

        let mut handles = Vec::new();
        let mut tasks = Vec::new();
        for id in 1..=hosts {
            let host = HostId(id);
            let runtime = HostRuntime {
                membership: membership.clone(),
                directory: placement.directory(host),
                migration: placement.migrator(host),
                transport: transport.clone(),
                message_filter: filter.clone(),
                tolerance: Arc::new(DefaultImbalanceRule::new(membership.as_ref())),
            };
            let (handle, task) =
                spawn(host, options, runtime, shutdown.child_token()).expect("spawn engine");
            transport.register(handle.clone());
            handles.push(handle);
            tasks.push(task);
        }

        Self {
            membership,
            placement,
            handles,
            shutdown,
            tasks,
        }
    }

    pub fn handle(&self, host: u64) -> &RepartitionerHandle {
        &self.handles[(host - 1) as usize]
    }

    /// Activates units of `type_id` with the given keys on `host`.
    pub fn place_units(&self, host: u64, type_id: u32, keys: Range<u32>) -> Vec<UnitId> {
        keys.map(|key| {
            let unit = UnitId::new(type_id, key);
            self.placement.place(unit, HostId(host));
            unit
        })
        .collect()
    }

    /// Records `times` request observations of `source` calling `target`,
    /// at both endpoint hosts like the runtime's send and receive paths.
    pub fn observe(&self, source: (UnitId, u64), target: (UnitId, u64), times: u64) {
        let message =
            SampledMessage::request((source.0, HostId(source.1)), (target.0, HostId(target.1)));
        for _ in 0..times {
            self.handle(source.1).sampler().record(message);
            if source.1 != target.1 {
                self.handle(target.1).sampler().record(message);
            }
        }
    }

    /// Drains every host's pending samples into its sketch.
    pub async fn flush_all(&self) {
        for handle in &self.handles {
            handle.flush().await.expect("flush");
        }
    }

    pub fn imbalance(&self, left: u64, right: u64) -> i64 {
        let left = self.placement.count_on(HostId(left)) as i64;
        let right = self.placement.count_on(HostId(right)) as i64;
        (left - right).abs()
    }

    /// Cancels every engine and waits for the tasks to stop.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("engine did not stop in time")
                .expect("engine task panicked");
        }
    }
}
