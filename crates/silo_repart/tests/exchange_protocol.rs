//! End-to-end exchange protocol scenarios over in-process clusters.

mod common;

use common::{manual_options, multi_round_options, TestCluster, UNIT_TYPE};
use silo_repart::{HostId, UnitId};

#[tokio::test]
async fn lopsided_pair_converges_in_one_round() {
    let cluster = TestCluster::start(2, manual_options()).await;

    // Host 1 carries 120 units, 100 of which talk exclusively to units on
    // host 2; host 2 carries 20 units.
    let heavy = cluster.place_units(1, UNIT_TYPE, 0..120);
    let light = cluster.place_units(2, UNIT_TYPE, 1000..1020);
    for (index, unit) in heavy.iter().take(100).enumerate() {
        let partner = light[index % light.len()];
        cluster.observe((*unit, 1), (partner, 2), 10);
    }
    cluster.flush_all().await;

    let before = cluster.imbalance(1, 2);
    assert_eq!(before, 100);

    cluster.handle(1).trigger_round().await.expect("round");

    let after = cluster.imbalance(1, 2);
    assert!(after <= before, "imbalance grew from {before} to {after}");
    assert!(
        cluster.placement.migration_count() > 0,
        "the exchange must move at least one unit"
    );

    // Both sides finalized exactly one exchange.
    let status_1 = cluster.handle(1).status().await.unwrap();
    let status_2 = cluster.handle(2).status().await.unwrap();
    assert_eq!(status_1.completed_exchanges + status_2.completed_exchanges, 2);
    assert_eq!(status_1.exchange_partner, None);
    assert_eq!(status_2.exchange_partner, None);

    // Sketches were purged of every edge touching a migrated unit.
    let moved: Vec<UnitId> = heavy
        .iter()
        .copied()
        .filter(|unit| cluster.placement.host_of(*unit) == Some(HostId(2)))
        .collect();
    assert!(!moved.is_empty());
    for handle in &cluster.handles {
        for (edge, _) in handle.edge_frequencies().await.unwrap() {
            for unit in &moved {
                assert_ne!(edge.source.id, *unit, "stale edge for migrated {unit}");
                assert_ne!(edge.target.id, *unit, "stale edge for migrated {unit}");
            }
        }
    }

    cluster.stop().await;
}

#[tokio::test]
async fn mutual_initiation_resolves_to_exactly_one_exchange() {
    let cluster = TestCluster::start(2, manual_options()).await;

    let left = cluster.place_units(1, UNIT_TYPE, 0..30);
    let right = cluster.place_units(2, UNIT_TYPE, 1000..1030);
    // Symmetric cross-host chatter so both sides build non-empty offers.
    for index in 0..10 {
        cluster.observe((left[index], 1), (right[index], 2), 10);
    }
    cluster.flush_all().await;

    let (first, second) = tokio::join!(
        cluster.handle(1).trigger_round(),
        cluster.handle(2).trigger_round(),
    );
    first.expect("host 1 round");
    second.expect("host 2 round");

    let status_1 = cluster.handle(1).status().await.unwrap();
    let status_2 = cluster.handle(2).status().await.unwrap();

    // However the rounds interleave, the tie-break admits exactly one
    // exchange episode: one finalization on each side.
    assert_eq!(
        status_1.completed_exchanges + status_2.completed_exchanges,
        2,
        "exactly one exchange may conclude"
    );
    assert_eq!(status_1.exchange_partner, None);
    assert_eq!(status_2.exchange_partner, None);

    // No unit was lost or duplicated along the way.
    assert_eq!(cluster.placement.total_units(), 60);

    cluster.stop().await;
}

#[tokio::test]
async fn anchored_units_stay_put_until_counters_reset() {
    let cluster = TestCluster::start(2, multi_round_options()).await;

    // `anchored` talks to a local partner far more than to its remote peer.
    let anchored = cluster.place_units(1, UNIT_TYPE, 0..1)[0];
    let local_partner = cluster.place_units(1, UNIT_TYPE, 1..2)[0];
    let remote_peer = cluster.place_units(2, UNIT_TYPE, 1000..1001)[0];
    cluster.observe((anchored, 1), (local_partner, 1), 50);
    cluster.observe((anchored, 1), (remote_peer, 2), 10);
    // Keep the remote peer anchored on its own host for the early rounds.
    let peer_neighbor = cluster.place_units(2, UNIT_TYPE, 1001..1002)[0];
    cluster.observe((remote_peer, 2), (peer_neighbor, 2), 100);

    // Unrelated remote-heavy units so the first round has something to move.
    let movers = cluster.place_units(1, UNIT_TYPE, 10..13);
    let targets = cluster.place_units(2, UNIT_TYPE, 1010..1013);
    for (mover, target) in movers.iter().zip(&targets) {
        cluster.observe((*mover, 1), (*target, 2), 20);
    }
    cluster.flush_all().await;

    cluster.handle(1).trigger_round().await.expect("round 1");
    assert_eq!(cluster.placement.host_of(anchored), Some(HostId(1)));

    // Once anchored, fresh remote traffic is folded into the host surrogate
    // and never makes the unit a candidate again.
    cluster.observe((anchored, 1), (remote_peer, 2), 40);
    cluster.flush_all().await;
    cluster.handle(1).trigger_round().await.expect("round 2");
    assert_eq!(cluster.placement.host_of(anchored), Some(HostId(1)));
    assert_eq!(cluster.placement.host_of(remote_peer), Some(HostId(2)));

    // Resetting the counters clears the anchor; heavy remote traffic now
    // pulls the pair together.
    for handle in &cluster.handles {
        handle.reset_counters().await.unwrap();
    }
    assert_ne!(
        cluster.placement.host_of(anchored),
        cluster.placement.host_of(remote_peer)
    );
    cluster.observe((anchored, 1), (remote_peer, 2), 100);
    cluster.flush_all().await;
    cluster.handle(1).trigger_round().await.expect("round 3");

    assert_eq!(
        cluster.placement.host_of(anchored),
        cluster.placement.host_of(remote_peer),
        "after the reset the chatty pair must co-locate"
    );

    cluster.stop().await;
}

#[tokio::test]
async fn failed_migrations_do_not_abort_the_round() {
    let cluster = TestCluster::start(2, manual_options()).await;

    let units = cluster.place_units(1, UNIT_TYPE, 0..10);
    cluster.place_units(2, UNIT_TYPE, 1000..1002);
    let remote_targets = cluster.place_units(2, UNIT_TYPE, 2000..2010);
    for (unit, target) in units.iter().zip(&remote_targets) {
        cluster.observe((*unit, 1), (*target, 2), 10);
    }
    cluster.flush_all().await;

    // One of the offered units refuses to migrate.
    cluster.placement.poison(units[0]);

    cluster.handle(1).trigger_round().await.expect("round");

    // The poisoned unit stays, the round still concludes, and other units
    // were free to move.
    assert_eq!(cluster.placement.host_of(units[0]), Some(HostId(1)));
    let status_1 = cluster.handle(1).status().await.unwrap();
    let status_2 = cluster.handle(2).status().await.unwrap();
    assert_eq!(status_1.completed_exchanges + status_2.completed_exchanges, 2);
    assert!(cluster.placement.migration_count() > 0);

    cluster.stop().await;
}

#[tokio::test]
async fn sampling_follows_membership_changes() {
    use silo_repart::membership::HostStatus;
    use std::time::Duration;

    let cluster = TestCluster::start(2, manual_options()).await;
    assert!(cluster.handle(1).status().await.unwrap().sampling_enabled);

    cluster.membership.set_status(HostId(2), HostStatus::Dead);

    // The engine observes the change asynchronously; poll briefly.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let status = cluster.handle(1).status().await.unwrap();
        if !status.sampling_enabled {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sampling was not disabled after membership dropped to one host"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cluster.stop().await;
}

#[tokio::test]
async fn single_host_clusters_never_exchange() {
    let cluster = TestCluster::start(1, manual_options()).await;

    let units = cluster.place_units(1, UNIT_TYPE, 0..5);
    // Sampling is disabled with one active host, so nothing is recorded.
    cluster.observe((units[0], 1), (units[1], 1), 10);
    cluster.flush_all().await;

    cluster.handle(1).trigger_round().await.expect("round");

    let status = cluster.handle(1).status().await.unwrap();
    assert!(!status.sampling_enabled);
    assert_eq!(status.completed_exchanges, 0);
    assert_eq!(status.tracked_edges, 0);
    assert_eq!(cluster.placement.migration_count(), 0);

    // The reported load is the directory count plus the adjustable offset.
    assert_eq!(cluster.handle(1).activation_count().await.unwrap(), 5);
    cluster
        .handle(1)
        .set_activation_count_offset(3)
        .await
        .unwrap();
    assert_eq!(cluster.handle(1).activation_count().await.unwrap(), 8);

    cluster.stop().await;
}
