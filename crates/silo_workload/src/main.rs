// Repartitioning workload simulator.
//
// Builds an in-process cluster of N hosts, activates synthetic units with a
// skewed communication graph (some pairs chat locally, some across hosts),
// pumps sampled traffic through every host's engine, and runs exchange
// rounds. Reports how much cross-host chatter the protocol eliminated.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use silo_repart::directory::InMemoryCluster;
use silo_repart::membership::StaticMembership;
use silo_repart::sampler::{SampledMessage, TypeMovabilityFilter};
use silo_repart::tolerance::DefaultImbalanceRule;
use silo_repart::transport::InProcessTransport;
use silo_repart::{
    spawn, HostId, HostRuntime, RepartitionerHandle, RepartitionerOptions, UnitId,
};

/// Type id for movable application units.
const UNIT_TYPE: u32 = 1;
/// Type id registered as immovable (stands in for system targets, proxies,
/// and pinned types).
const IMMOVABLE_TYPE: u32 = 99;

#[derive(Parser, Debug)]
#[command(name = "silo-workload")]
struct Args {
    /// Number of simulated hosts.
    #[arg(long, default_value_t = 3)]
    hosts: u64,

    /// Movable units activated per host.
    #[arg(long, default_value_t = 200)]
    units_per_host: u32,

    /// Immovable units activated per host.
    #[arg(long, default_value_t = 5)]
    immovable_per_host: u32,

    /// Fraction of units whose conversation partner lives on another host.
    #[arg(long, default_value_t = 0.4)]
    remote_ratio: f64,

    /// Messages per conversation pair per iteration.
    #[arg(long, default_value_t = 20)]
    messages_per_pair: u64,

    /// Exchange iterations (traffic + one round per host).
    #[arg(long, default_value_t = 5)]
    rounds: usize,

    /// Cooldown between exchanges.
    #[arg(long, default_value = "1ms")]
    recovery_period: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write a JSON summary to this path.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RoundReport {
    round: usize,
    cross_host_pairs: usize,
    migrations: u64,
    units_per_host: Vec<usize>,
}

#[derive(Debug, Serialize)]
struct Summary {
    hosts: u64,
    units: usize,
    pairs: usize,
    seed: u64,
    initial_cross_host_pairs: usize,
    final_cross_host_pairs: usize,
    total_migrations: u64,
    rounds: Vec<RoundReport>,
}

struct SimHost {
    id: HostId,
    handle: RepartitionerHandle,
    task: tokio::task::JoinHandle<()>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.hosts >= 1, "--hosts must be at least 1");
    anyhow::ensure!(
        args.units_per_host >= 2,
        "--units-per-host must be at least 2 so local pairs exist"
    );
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let mut rng = SmallRng::seed_from_u64(seed);
    tracing::info!(hosts = args.hosts, seed, "starting repartitioning simulation");

    let membership = Arc::new(StaticMembership::new((1..=args.hosts).map(HostId)));
    let placement = InMemoryCluster::new();
    let transport = Arc::new(InProcessTransport::new(Duration::from_secs(30)));
    let filter = Arc::new(TypeMovabilityFilter::new([IMMOVABLE_TYPE]));
    let shutdown = CancellationToken::new();

    let options = RepartitionerOptions {
        // Rounds are driven manually; keep the timers out of the way.
        min_round_period: Duration::from_secs(3_600),
        max_round_period: Duration::from_secs(7_200),
        recovery_period: (*args.recovery_period).min(Duration::from_secs(3_600)),
        ..Default::default()
    };

    let mut hosts = Vec::new();
    for id in 1..=args.hosts {
        let host = HostId(id);
        let runtime = HostRuntime {
            membership: membership.clone(),
            directory: placement.directory(host),
            migration: placement.migrator(host),
            transport: transport.clone(),
            message_filter: filter.clone(),
            tolerance: Arc::new(DefaultImbalanceRule::new(membership.as_ref())),
        };
        let (handle, task) = spawn(host, options, runtime, shutdown.child_token())
            .context("failed to spawn repartitioner")?;
        transport.register(handle.clone());
        hosts.push(SimHost { id: host, handle, task });
    }

    // Activate units and wire up conversation pairs. Immovable units join
    // the partner pool so the movability filter sees real traffic.
    let mut pairs: Vec<(UnitId, UnitId)> = Vec::new();
    let mut all_units = Vec::new();
    let mut partner_pool = Vec::new();
    for (index, host) in hosts.iter().enumerate() {
        let base = index as u32 * (args.units_per_host + args.immovable_per_host);
        for key in 0..args.units_per_host {
            let unit = UnitId::new(UNIT_TYPE, base + key);
            placement.place(unit, host.id);
            all_units.push(unit);
            partner_pool.push(unit);
        }
        for key in 0..args.immovable_per_host {
            let unit = UnitId::new(IMMOVABLE_TYPE, base + args.units_per_host + key);
            placement.place(unit, host.id);
            partner_pool.push(unit);
        }
    }
    for &unit in &all_units {
        let home = placement.host_of(unit).expect("unit placed");
        let partner = if args.hosts > 1 && rng.gen_bool(args.remote_ratio) {
            loop {
                let candidate = partner_pool[rng.gen_range(0..partner_pool.len())];
                if candidate != unit && placement.host_of(candidate) != Some(home) {
                    break candidate;
                }
            }
        } else {
            loop {
                let candidate = partner_pool[rng.gen_range(0..partner_pool.len())];
                if candidate != unit && placement.host_of(candidate) == Some(home) {
                    break candidate;
                }
            }
        };
        pairs.push((unit, partner));
    }

    let initial_cross = cross_host_pairs(&placement, &pairs);
    tracing::info!(
        units = all_units.len(),
        pairs = pairs.len(),
        cross_host_pairs = initial_cross,
        "communication graph built"
    );

    let mut reports = Vec::new();
    for round in 1..=args.rounds {
        // Traffic follows current placement, like live routing would.
        for &(source, target) in &pairs {
            let source_host = placement.host_of(source).expect("placed");
            let target_host = placement.host_of(target).expect("placed");
            let message =
                SampledMessage::request((source, source_host), (target, target_host));
            for _ in 0..args.messages_per_pair {
                host_handle(&hosts, source_host).sampler().record(message);
                if source_host != target_host {
                    host_handle(&hosts, target_host).sampler().record(message);
                }
            }
        }
        for host in &hosts {
            host.handle.flush().await?;
        }
        for host in &hosts {
            host.handle.trigger_round().await?;
        }

        let report = RoundReport {
            round,
            cross_host_pairs: cross_host_pairs(&placement, &pairs),
            migrations: placement.migration_count(),
            units_per_host: hosts
                .iter()
                .map(|host| placement.count_on(host.id))
                .collect(),
        };
        tracing::info!(
            round,
            cross_host_pairs = report.cross_host_pairs,
            migrations = report.migrations,
            units = ?report.units_per_host,
            "round complete"
        );
        reports.push(report);
    }

    let summary = Summary {
        hosts: args.hosts,
        units: all_units.len(),
        pairs: pairs.len(),
        seed,
        initial_cross_host_pairs: initial_cross,
        final_cross_host_pairs: reports
            .last()
            .map(|report| report.cross_host_pairs)
            .unwrap_or(initial_cross),
        total_migrations: placement.migration_count(),
        rounds: reports,
    };
    tracing::info!(
        initial = summary.initial_cross_host_pairs,
        now = summary.final_cross_host_pairs,
        migrations = summary.total_migrations,
        "simulation finished"
    );

    if let Some(path) = &args.out {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(path, serde_json::to_vec_pretty(&summary)?)
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
        tracing::info!(path = %path.display(), "summary written");
    }

    shutdown.cancel();
    for host in hosts {
        tokio::time::timeout(Duration::from_secs(5), host.task)
            .await
            .context("engine did not stop in time")?
            .context("engine task panicked")?;
    }
    Ok(())
}

fn host_handle(hosts: &[SimHost], host: HostId) -> &RepartitionerHandle {
    &hosts
        .iter()
        .find(|entry| entry.id == host)
        .expect("host exists")
        .handle
}

fn cross_host_pairs(placement: &InMemoryCluster, pairs: &[(UnitId, UnitId)]) -> usize {
    pairs
        .iter()
        .filter(|(left, right)| placement.host_of(*left) != placement.host_of(*right))
        .count()
}
