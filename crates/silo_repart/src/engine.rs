//! The exchange protocol engine.
//!
//! One engine task runs per host and owns every piece of mutable protocol
//! state: the frequency sketch, the anchoring filter, the exchange guard,
//! and the round timer. Commands (inbound exchange requests, manual
//! triggers, introspection) and ingestion wakeups are multiplexed onto the
//! task's select loop, which serializes rounds, request handling, and
//! sketch mutation without any locking.
//!
//! A round picks the remote host with the highest total transfer score,
//! offers it the local candidate set, and the responder computes a mutually
//! beneficial transfer set with two max-heaps under the imbalance tolerance
//! rule. Two hosts initiating toward each other at once are untangled by an
//! address tie-break in which exactly one side proceeds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bloom::BlockedBloomFilter;
use crate::directory::{ActivationDirectory, MigrationManager};
use crate::frequency::FrequentEdgeCounter;
use crate::heap::{HeapStore, MaxHeap, NO_HEAP_INDEX};
use crate::ids::{CandidateVertex, ConnectedVertex, Direction, Edge, HostId, UnitId};
use crate::membership::{MembershipOracle, MembershipSnapshot};
use crate::options::RepartitionerOptions;
use crate::sampler::{self, MessageFilter, MessageSampler, SamplerConsumer};
use crate::tolerance::ImbalanceToleranceRule;
use crate::transport::{AcceptExchangeRequest, AcceptExchangeResponse, ExchangeTransport};

/// External collaborators of one host's engine.
#[derive(Clone)]
pub struct HostRuntime {
    pub membership: Arc<dyn MembershipOracle>,
    pub directory: Arc<dyn ActivationDirectory>,
    pub migration: Arc<dyn MigrationManager>,
    pub transport: Arc<dyn ExchangeTransport>,
    pub message_filter: Arc<dyn MessageFilter>,
    pub tolerance: Arc<dyn ImbalanceToleranceRule>,
}

/// Introspection snapshot of one engine.
#[derive(Clone, Copy, Debug)]
pub struct EngineStatus {
    pub host: HostId,
    pub exchange_partner: Option<HostId>,
    pub completed_exchanges: u64,
    pub tracked_edges: usize,
    pub sampling_enabled: bool,
}

enum EngineCommand {
    AcceptExchange {
        request: AcceptExchangeRequest,
        reply: oneshot::Sender<AcceptExchangeResponse>,
    },
    ExchangeOutcome {
        partner: HostId,
        outcome: anyhow::Result<AcceptExchangeResponse>,
    },
    TriggerRound {
        done: oneshot::Sender<()>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
    ResetCounters {
        done: oneshot::Sender<()>,
    },
    SetActivationCountOffset(i64),
    GetActivationCount {
        reply: oneshot::Sender<i64>,
    },
    GetStatus {
        reply: oneshot::Sender<EngineStatus>,
    },
    GetEdgeFrequencies {
        reply: oneshot::Sender<Vec<(Edge, u64)>>,
    },
}

/// Client handle to a spawned engine. Cloneable; all operations are routed
/// through the engine's serialized command loop.
#[derive(Clone)]
pub struct RepartitionerHandle {
    host: HostId,
    commands: mpsc::Sender<EngineCommand>,
    sampler: MessageSampler,
}

impl RepartitionerHandle {
    pub fn host(&self) -> HostId {
        self.host
    }

    /// The hot-path sampler feeding this engine.
    pub fn sampler(&self) -> &MessageSampler {
        &self.sampler
    }

    /// Delivers an inbound exchange request and waits for the verdict.
    pub async fn accept_exchange(
        &self,
        request: AcceptExchangeRequest,
    ) -> anyhow::Result<AcceptExchangeResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::AcceptExchange { request, reply })
            .await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("engine dropped the exchange request"))
    }

    /// Fires an exchange round immediately, resolving when the round has
    /// fully concluded (including finalization).
    pub async fn trigger_round(&self) -> anyhow::Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(EngineCommand::TriggerRound { done }).await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("engine stopped mid-round"))
    }

    /// Drains every buffered sample into the sketch before returning.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(EngineCommand::Flush { done }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("engine stopped"))
    }

    /// Clears the pending buffer, the sketch, and the anchoring filter.
    pub async fn reset_counters(&self) -> anyhow::Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(EngineCommand::ResetCounters { done }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("engine stopped"))
    }

    /// Biases the activation count reported during exchanges.
    pub async fn set_activation_count_offset(&self, offset: i64) -> anyhow::Result<()> {
        self.send(EngineCommand::SetActivationCountOffset(offset))
            .await
    }

    pub async fn activation_count(&self) -> anyhow::Result<i64> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::GetActivationCount { reply }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("engine stopped"))
    }

    pub async fn status(&self) -> anyhow::Result<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::GetStatus { reply }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("engine stopped"))
    }

    /// Current sketch contents as (edge, estimated count) pairs.
    pub async fn edge_frequencies(&self) -> anyhow::Result<Vec<(Edge, u64)>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::GetEdgeFrequencies { reply }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("engine stopped"))
    }

    async fn send(&self, command: EngineCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("repartitioner for {} stopped", self.host))
    }
}

/// Spawns the engine task for `host`. Fails fast on invalid options.
pub fn spawn(
    host: HostId,
    options: RepartitionerOptions,
    runtime: HostRuntime,
    shutdown: CancellationToken,
) -> anyhow::Result<(RepartitionerHandle, JoinHandle<()>)> {
    options.validate()?;
    let anchored_filter = options
        .anchoring_filter_enabled
        .then(|| {
            BlockedBloomFilter::new(
                options.anchoring_filter_capacity,
                options.probabilistic_filtering_max_allowed_error_rate,
            )
        })
        .transpose()?;

    let (sampler, consumer) = sampler::channel(options.max_unprocessed_edges);
    let membership_rx = runtime.membership.subscribe();
    let sampling_enabled = membership_rx.borrow().active_count() > 1;
    sampler.set_enabled(sampling_enabled);

    let (commands_tx, commands) = mpsc::channel(64);
    let handle = RepartitionerHandle {
        host,
        commands: commands_tx.clone(),
        sampler: sampler.clone(),
    };

    let engine = Repartitioner {
        host,
        next_round: tokio::time::Instant::now() + random_round_period(&options),
        options,
        runtime,
        commands,
        commands_tx,
        consumer,
        sampler,
        edge_weights: FrequentEdgeCounter::new(options.max_edge_count),
        anchored_filter,
        exchange: ExchangeState::Idle,
        last_exchanged: None,
        activation_count_offset: 0,
        sampling_enabled,
        completed_exchanges: 0,
        round: None,
        membership_rx,
        membership_closed: false,
        shutdown,
    };
    let task = tokio::spawn(engine.run());
    Ok((handle, task))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExchangeState {
    Idle,
    ExchangingWith(HostId),
}

struct RoundState {
    sets: Vec<HostCandidateSet>,
    next: usize,
    anchored: HashSet<UnitId>,
    done: Option<oneshot::Sender<()>>,
}

struct Repartitioner {
    host: HostId,
    options: RepartitionerOptions,
    runtime: HostRuntime,
    commands: mpsc::Receiver<EngineCommand>,
    commands_tx: mpsc::Sender<EngineCommand>,
    consumer: SamplerConsumer,
    sampler: MessageSampler,
    edge_weights: FrequentEdgeCounter,
    anchored_filter: Option<BlockedBloomFilter>,
    exchange: ExchangeState,
    /// `None` until the first completed exchange; cooldown applies after.
    last_exchanged: Option<Instant>,
    activation_count_offset: i64,
    sampling_enabled: bool,
    completed_exchanges: u64,
    round: Option<RoundState>,
    next_round: tokio::time::Instant,
    membership_rx: watch::Receiver<MembershipSnapshot>,
    membership_closed: bool,
    shutdown: CancellationToken,
}

impl Repartitioner {
    async fn run(mut self) {
        debug!(host = %self.host, "repartitioner started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(self.next_round) => {
                    self.start_round(None).await;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = self.consumer.wait() => self.drain_pending(),
                result = self.membership_rx.changed(), if !self.membership_closed => {
                    match result {
                        Ok(()) => self.on_membership_change(),
                        Err(_) => self.membership_closed = true,
                    }
                }
            }
        }
        debug!(host = %self.host, "repartitioner stopped");
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::AcceptExchange { request, reply } => {
                self.on_accept_exchange(request, reply).await;
            }
            EngineCommand::ExchangeOutcome { partner, outcome } => {
                self.on_exchange_outcome(partner, outcome).await;
            }
            EngineCommand::TriggerRound { done } => self.start_round(Some(done)).await,
            EngineCommand::Flush { done } => {
                self.flush_pending();
                let _ = done.send(());
            }
            EngineCommand::ResetCounters { done } => {
                self.consumer.purge();
                self.edge_weights.clear();
                if let Some(filter) = &mut self.anchored_filter {
                    filter.reset();
                }
                debug!(host = %self.host, "repartitioning counters reset");
                let _ = done.send(());
            }
            EngineCommand::SetActivationCountOffset(offset) => {
                self.activation_count_offset = offset;
            }
            EngineCommand::GetActivationCount { reply } => {
                let _ = reply.send(self.local_activation_count());
            }
            EngineCommand::GetStatus { reply } => {
                let _ = reply.send(EngineStatus {
                    host: self.host,
                    exchange_partner: match self.exchange {
                        ExchangeState::Idle => None,
                        ExchangeState::ExchangingWith(partner) => Some(partner),
                    },
                    completed_exchanges: self.completed_exchanges,
                    tracked_edges: self.edge_weights.len(),
                    sampling_enabled: self.sampling_enabled,
                });
            }
            EngineCommand::GetEdgeFrequencies { reply } => {
                let frequencies = self
                    .edge_weights
                    .elements()
                    .map(|(edge, count, _)| (*edge, count))
                    .collect();
                let _ = reply.send(frequencies);
            }
        }
    }

    // ---- ingestion -------------------------------------------------------

    fn drain_pending(&mut self) {
        const BATCH: usize = 256;
        const BATCHES_PER_WAKEUP: usize = 4;

        let mut buffer = Vec::with_capacity(BATCH);
        for _ in 0..BATCHES_PER_WAKEUP {
            buffer.clear();
            let more = self.consumer.drain_into(&mut buffer, BATCH);
            for message in &buffer {
                let edges = sampler::classify(
                    message,
                    self.host,
                    self.runtime.message_filter.as_ref(),
                    self.anchored_filter.as_ref(),
                );
                for edge in edges.into_iter().flatten() {
                    self.edge_weights.add(edge);
                }
            }
            if !more {
                return;
            }
        }
        // Backlog remains; re-arm the wakeup so other work gets a turn
        // before the next batch.
        self.consumer.renotify();
    }

    fn flush_pending(&mut self) {
        const BATCH: usize = 256;
        let mut buffer = Vec::with_capacity(BATCH);
        loop {
            buffer.clear();
            let more = self.consumer.drain_into(&mut buffer, BATCH);
            for message in &buffer {
                let edges = sampler::classify(
                    message,
                    self.host,
                    self.runtime.message_filter.as_ref(),
                    self.anchored_filter.as_ref(),
                );
                for edge in edges.into_iter().flatten() {
                    self.edge_weights.add(edge);
                }
            }
            if !more {
                return;
            }
        }
    }

    fn on_membership_change(&mut self) {
        let active = self.membership_rx.borrow_and_update().active_count();
        let enable = active > 1;
        if enable != self.sampling_enabled {
            self.sampling_enabled = enable;
            self.sampler.set_enabled(enable);
            debug!(
                host = %self.host,
                active_hosts = active,
                enabled = enable,
                "message sampling toggled"
            );
        }
    }

    // ---- initiator role --------------------------------------------------

    async fn start_round(&mut self, done: Option<oneshot::Sender<()>>) {
        if let Some(last) = self.last_exchanged {
            let elapsed = last.elapsed();
            if elapsed < self.options.recovery_period {
                // Wait out the remainder through the timer instead of
                // sleeping here, which would stall inbound request handling
                // for up to the whole recovery period.
                let remaining = self.options.recovery_period - elapsed;
                debug!(host = %self.host, remaining = ?remaining, "cooling down before next round");
                self.next_round = tokio::time::Instant::now() + remaining;
                complete(done);
                return;
            }
        }

        self.schedule_next_round();

        if self.round.is_some() || self.exchange != ExchangeState::Idle {
            trace!(host = %self.host, "exchange already in progress; skipping round");
            complete(done);
            return;
        }
        let active = self.runtime.membership.active_hosts();
        if active.len() < 2 {
            debug!(host = %self.host, "single-host cluster; nothing to repartition");
            complete(done);
            return;
        }
        if !self.sampling_enabled {
            complete(done);
            return;
        }

        let started = Instant::now();
        let groups = migration_candidates(&self.edge_weights, self.host);
        let sets = candidate_sets(&groups, self.host, &active);
        let anchored = anchored_units(&groups);
        debug!(
            host = %self.host,
            elapsed = ?started.elapsed(),
            candidate_sets = sets.len(),
            anchored = anchored.len(),
            "computed candidate sets"
        );

        self.round = Some(RoundState {
            sets,
            next: 0,
            anchored,
            done,
        });
        self.advance_round();
    }

    /// Sends the request for the next non-empty candidate set, or concludes
    /// the round when none remain. The remote call runs in its own task so
    /// inbound requests are still served while the response is in flight;
    /// the outcome comes back as a command.
    fn advance_round(&mut self) {
        while let Some((partner, offered)) = self.next_candidate_set() {
            let request = AcceptExchangeRequest {
                sending_host: self.host,
                exchange_set: offered,
                activation_count_snapshot: self.local_activation_count(),
            };
            self.exchange = ExchangeState::ExchangingWith(partner);
            debug!(
                host = %self.host,
                partner = %partner,
                offered = request.exchange_set.len(),
                "initiating exchange"
            );
            let transport = Arc::clone(&self.runtime.transport);
            let commands = self.commands_tx.clone();
            tokio::spawn(async move {
                let outcome = transport.accept_exchange(partner, request).await;
                let _ = commands
                    .send(EngineCommand::ExchangeOutcome { partner, outcome })
                    .await;
            });
            return;
        }
        self.conclude_round();
    }

    fn next_candidate_set(&mut self) -> Option<(HostId, Vec<CandidateVertex>)> {
        let round = self.round.as_mut()?;
        while let Some(set) = round.sets.get(round.next) {
            round.next += 1;
            if set.offered.is_empty() {
                trace!(partner = %set.host, "exchange set is empty; skipping candidate");
                continue;
            }
            return Some((set.host, set.offered.clone()));
        }
        None
    }

    fn conclude_round(&mut self) {
        self.exchange = ExchangeState::Idle;
        if let Some(round) = self.round.take() {
            complete(round.done);
        }
    }

    async fn on_exchange_outcome(
        &mut self,
        partner: HostId,
        outcome: anyhow::Result<AcceptExchangeResponse>,
    ) {
        if self.round.is_none() {
            // The round was torn down (e.g. counters were reset) while the
            // request was in flight.
            self.exchange = ExchangeState::Idle;
            return;
        }
        match outcome {
            Ok(AcceptExchangeResponse::Success {
                accepted_units,
                given_units,
            }) => {
                let anchored = self
                    .round
                    .as_mut()
                    .map(|round| std::mem::take(&mut round.anchored))
                    .unwrap_or_default();
                self.finalize_exchange(&accepted_units, &given_units, partner, &anchored)
                    .await;
                self.conclude_round();
            }
            Ok(AcceptExchangeResponse::ExchangedRecently) => {
                debug!(
                    host = %self.host,
                    partner = %partner,
                    "partner exchanged recently; trying next candidate"
                );
                self.exchange = ExchangeState::Idle;
                self.advance_round();
            }
            Ok(AcceptExchangeResponse::MutualExchangeAttempt) => {
                debug!(
                    host = %self.host,
                    partner = %partner,
                    "mutual exchange attempt lost the tie-break; abandoning round"
                );
                self.conclude_round();
            }
            Err(error) => {
                warn!(
                    host = %self.host,
                    partner = %partner,
                    error = ?error,
                    "exchange failed; trying next candidate"
                );
                self.exchange = ExchangeState::Idle;
                self.advance_round();
            }
        }
    }

    // ---- responder role --------------------------------------------------

    async fn on_accept_exchange(
        &mut self,
        request: AcceptExchangeRequest,
        reply: oneshot::Sender<AcceptExchangeResponse>,
    ) {
        let sender = request.sending_host;
        debug!(
            host = %self.host,
            sender = %sender,
            offered = request.exchange_set.len(),
            sender_activations = request.activation_count_snapshot,
            "received exchange request"
        );

        if let ExchangeState::ExchangingWith(current) = self.exchange {
            if current == sender {
                // Mutual exchange attempt. The `<=` comparison breaks the
                // tie so exactly one side proceeds; the loser reschedules
                // its own round sooner, with the minimum period already
                // subtracted so the wait is not served twice.
                if self.host <= sender {
                    let wait = random_round_period(&self.options)
                        .saturating_sub(self.options.min_round_period);
                    self.next_round = tokio::time::Instant::now() + wait;
                    debug!(
                        host = %self.host,
                        sender = %sender,
                        "mutual exchange attempt; yielding to sender"
                    );
                    let _ = reply.send(AcceptExchangeResponse::MutualExchangeAttempt);
                    return;
                }
                // Our address sorts after the sender's, so this side keeps
                // acting as the responder; the round it initiated will be
                // rejected over there.
            } else {
                debug!(
                    host = %self.host,
                    sender = %sender,
                    current = %current,
                    "already exchanging with another host; rejecting"
                );
                let _ = reply.send(AcceptExchangeResponse::ExchangedRecently);
                return;
            }
        }

        if let Some(last) = self.last_exchanged {
            let elapsed = last.elapsed();
            if elapsed < self.options.recovery_period {
                debug!(
                    host = %self.host,
                    sender = %sender,
                    elapsed = ?elapsed,
                    recovery = ?self.options.recovery_period,
                    "exchanged recently; rejecting"
                );
                let _ = reply.send(AcceptExchangeResponse::ExchangedRecently);
                return;
            }
        }

        // Guard the rest of the request processing.
        self.exchange = ExchangeState::ExchangingWith(sender);
        let response = self.respond_to_exchange(request).await;
        self.exchange = ExchangeState::Idle;
        let _ = reply.send(response);
    }

    async fn respond_to_exchange(
        &mut self,
        request: AcceptExchangeRequest,
    ) -> AcceptExchangeResponse {
        let sender = request.sending_host;
        let groups = migration_candidates(&self.edge_weights, self.host);
        let local_set = candidates_for_host(&groups, sender);
        let newly_anchored = anchored_units(&groups);

        let remote_activations = request.activation_count_snapshot;
        let local_activations = self.local_activation_count();
        debug!(
            host = %self.host,
            sender = %sender,
            imbalance = imbalance(remote_activations, local_activations),
            local_candidates = local_set.len(),
            "processing exchange offer"
        );

        let started = Instant::now();
        let transfer = compute_transfer_set(
            local_set,
            request.exchange_set,
            local_activations,
            remote_activations,
            self.runtime.tolerance.as_ref(),
        )
        .await;
        debug!(
            host = %self.host,
            sender = %sender,
            elapsed = ?started.elapsed(),
            giving = transfer.give.len(),
            accepting = transfer.accept.len(),
            imbalance = transfer.imbalance,
            "transfer set computed"
        );

        self.finalize_exchange(&transfer.give, &transfer.accept, sender, &newly_anchored)
            .await;

        AcceptExchangeResponse::Success {
            accepted_units: transfer.accept,
            given_units: transfer.give,
        }
    }

    // ---- shared finalization --------------------------------------------

    /// Migrates `giving` toward `partner`, waits for the local activations
    /// to deactivate, records the newly anchored units, and purges every
    /// sketch entry touching a moved or anchored unit so the next round is
    /// not skewed by stale weights.
    async fn finalize_exchange(
        &mut self,
        giving: &[UnitId],
        accepting: &[UnitId],
        partner: HostId,
        newly_anchored: &HashSet<UnitId>,
    ) {
        use futures_util::stream::{FuturesUnordered, StreamExt};

        let mut deactivations = FuturesUnordered::new();
        for &unit in giving {
            if !self.runtime.directory.contains(unit) {
                continue;
            }
            let migration = Arc::clone(&self.runtime.migration);
            deactivations.push(async move { (unit, migration.migrate(unit, partner).await) });
        }
        while let Some((unit, result)) = deactivations.next().await {
            if let Err(error) = result {
                // Out of our control at this point; the unit stays local and
                // remains a candidate for a future round.
                warn!(
                    host = %self.host,
                    unit = %unit,
                    error = ?error,
                    "failed to migrate activation"
                );
            }
        }

        if let Some(filter) = &mut self.anchored_filter {
            debug!(
                host = %self.host,
                anchored = newly_anchored.len(),
                tracked_edges = self.edge_weights.len(),
                "recording anchored units"
            );
            for unit in newly_anchored {
                filter.add(unit);
            }
        }

        let mut affected: HashSet<UnitId> = HashSet::with_capacity(giving.len() + accepting.len());
        affected.extend(giving.iter().copied());
        affected.extend(accepting.iter().copied());

        if !affected.is_empty() || !newly_anchored.is_empty() {
            let anchored_filter = self.anchored_filter.as_ref();
            let stale: Vec<Edge> = self
                .edge_weights
                .elements()
                .filter(|(edge, _, _)| {
                    affected.contains(&edge.source.id)
                        || affected.contains(&edge.target.id)
                        || anchored_filter.is_some_and(|filter| {
                            filter.contains(&edge.source.id) || filter.contains(&edge.target.id)
                        })
                })
                .map(|(edge, _, _)| *edge)
                .collect();
            for edge in &stale {
                self.edge_weights.remove(edge);
            }
            trace!(host = %self.host, purged = stale.len(), "purged stale sketch entries");
        }

        self.last_exchanged = Some(Instant::now());
        self.completed_exchanges += 1;
        debug!(
            host = %self.host,
            partner = %partner,
            gave = giving.len(),
            accepted = accepting.len(),
            "exchange finalized"
        );
    }

    // ---- helpers ---------------------------------------------------------

    fn local_activation_count(&self) -> i64 {
        self.runtime.directory.activation_count() as i64 + self.activation_count_offset
    }

    fn schedule_next_round(&mut self) {
        let period = random_round_period(&self.options);
        self.next_round = tokio::time::Instant::now() + period;
        trace!(host = %self.host, period = ?period, "next round scheduled");
    }
}

fn complete(done: Option<oneshot::Sender<()>>) {
    if let Some(done) = done {
        let _ = done.send(());
    }
}

fn random_round_period(options: &RepartitionerOptions) -> Duration {
    use rand::Rng;
    let min = options.min_round_period.as_millis() as u64;
    let max = options.max_round_period.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

/// Pairwise activation-count imbalance.
fn imbalance(left: i64, right: i64) -> i64 {
    (left.abs() - right.abs()).abs()
}

// ---- candidate construction ---------------------------------------------

/// One sketch entry seen from the local host's perspective: `unit` is local,
/// `partner_unit` may be local or remote.
#[derive(Clone, Debug)]
struct LocalEdge {
    unit: UnitId,
    partner_unit: UnitId,
    movable: bool,
    partner_host: HostId,
    direction: Direction,
    weight: u64,
}

/// Movable local units grouped with all of their observed edges.
fn migration_candidates(
    edges: &FrequentEdgeCounter,
    local: HostId,
) -> HashMap<UnitId, Vec<LocalEdge>> {
    let mut groups: HashMap<UnitId, Vec<LocalEdge>> = HashMap::new();
    for (edge, weight, _) in edges.elements() {
        if weight == 0 {
            continue;
        }
        let local_edge = match edge.direction_from(local) {
            Some(Direction::LocalToLocal) => LocalEdge {
                unit: edge.source.id,
                partner_unit: edge.target.id,
                movable: edge.source.movable,
                partner_host: local,
                direction: Direction::LocalToLocal,
                weight,
            },
            Some(Direction::LocalToRemote) => LocalEdge {
                unit: edge.source.id,
                partner_unit: edge.target.id,
                movable: edge.source.movable,
                partner_host: edge.target.host,
                direction: Direction::LocalToRemote,
                weight,
            },
            Some(Direction::RemoteToLocal) => LocalEdge {
                unit: edge.target.id,
                partner_unit: edge.source.id,
                movable: edge.target.movable,
                partner_host: edge.source.host,
                direction: Direction::RemoteToLocal,
                weight,
            },
            // Neither endpoint local: the message was re-routed through
            // this host.
            None => continue,
        };
        if !local_edge.movable {
            continue;
        }
        groups.entry(local_edge.unit).or_default().push(local_edge);
    }
    groups
}

/// Candidates worth offering to `other_host`: units whose estimated traffic
/// toward that host outweighs their local traffic. Connected vertices keep
/// every observed partner (movable or not) since local partners raise the
/// cost of moving the candidate.
fn candidates_for_host(
    groups: &HashMap<UnitId, Vec<LocalEdge>>,
    other_host: HostId,
) -> Vec<CandidateVertex> {
    let mut result = Vec::new();
    for (unit, edges) in groups {
        let mut local_score = 0i64;
        let mut remote_score = 0i64;
        for edge in edges {
            match edge.direction {
                Direction::LocalToLocal => local_score += edge.weight as i64,
                Direction::LocalToRemote | Direction::RemoteToLocal => {
                    if edge.partner_host == other_host {
                        remote_score += edge.weight as i64;
                    }
                }
            }
        }
        if local_score >= remote_score {
            // Local calls outweigh the remote ones; moving would not pay.
            continue;
        }
        result.push(CandidateVertex {
            id: *unit,
            accumulated_transfer_score: remote_score - local_score,
            connected_vertices: edges
                .iter()
                .map(|edge| ConnectedVertex {
                    id: edge.partner_unit,
                    transfer_score: edge.weight,
                })
                .collect(),
        });
    }
    result
}

/// Units whose local traffic strictly dominates all remote traffic; moving
/// them would increase cross-host load.
fn anchored_units(groups: &HashMap<UnitId, Vec<LocalEdge>>) -> HashSet<UnitId> {
    let mut anchored = HashSet::new();
    for (unit, edges) in groups {
        let mut local_score = 0i64;
        let mut remote_score = 0i64;
        for edge in edges {
            match edge.direction {
                Direction::LocalToLocal => local_score += edge.weight as i64,
                _ => remote_score += edge.weight as i64,
            }
        }
        if local_score > remote_score {
            anchored.insert(*unit);
        }
    }
    anchored
}

#[derive(Clone, Debug)]
struct HostCandidateSet {
    host: HostId,
    offered: Vec<CandidateVertex>,
    total_transfer_score: i64,
}

/// Per-remote-host candidate sets, ordered by descending total score.
fn candidate_sets(
    groups: &HashMap<UnitId, Vec<LocalEdge>>,
    local: HostId,
    active: &[HostId],
) -> Vec<HostCandidateSet> {
    let mut sets = Vec::with_capacity(active.len().saturating_sub(1));
    for &host in active {
        if host == local {
            continue;
        }
        let offered = candidates_for_host(groups, host);
        let total_transfer_score = offered
            .iter()
            .map(|candidate| candidate.accumulated_transfer_score)
            .sum();
        sets.push(HostCandidateSet {
            host,
            offered,
            total_transfer_score,
        });
    }
    sets.sort_by_key(|set| std::cmp::Reverse(set.total_transfer_score));
    sets
}

// ---- transfer set computation -------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VertexLocation {
    Unknown,
    Local,
    Remote,
}

struct HeapVertex {
    id: UnitId,
    score: i64,
    location: VertexLocation,
    heap_index: u32,
    /// Links to other candidates resident in either set, with the single
    /// edge's weight. Partners outside both sets do not affect a two-party
    /// decision and carry no link.
    connected: Vec<(u32, i64)>,
}

#[derive(Default)]
struct VertexArena {
    vertices: Vec<HeapVertex>,
}

impl HeapStore for VertexArena {
    fn score(&self, id: u32) -> i64 {
        self.vertices[id as usize].score
    }

    fn heap_index(&self, id: u32) -> u32 {
        self.vertices[id as usize].heap_index
    }

    fn set_heap_index(&mut self, id: u32, index: u32) {
        self.vertices[id as usize].heap_index = index;
    }
}

fn get_or_add_vertex(
    arena: &mut VertexArena,
    index: &mut HashMap<UnitId, u32>,
    element: &CandidateVertex,
) -> u32 {
    *index.entry(element.id).or_insert_with(|| {
        arena.vertices.push(HeapVertex {
            id: element.id,
            score: element.accumulated_transfer_score,
            location: VertexLocation::Unknown,
            heap_index: NO_HEAP_INDEX,
            connected: Vec::new(),
        });
        (arena.vertices.len() - 1) as u32
    })
}

fn create_vertex(
    arena: &mut VertexArena,
    index: &mut HashMap<UnitId, u32>,
    source_index: &HashMap<UnitId, &CandidateVertex>,
    element: &CandidateVertex,
) -> u32 {
    let vertex = get_or_add_vertex(arena, index, element);
    for connected in &element.connected_vertices {
        // Partners absent from both sets are ignored for this computation.
        if let Some(connected_element) = source_index.get(&connected.id) {
            let link = get_or_add_vertex(arena, index, connected_element);
            arena.vertices[vertex as usize]
                .connected
                .push((link, connected.transfer_score as i64));
        }
    }
    vertex
}

fn build_candidate_heaps(
    local: &[CandidateVertex],
    remote: &[CandidateVertex],
) -> (VertexArena, MaxHeap, MaxHeap) {
    let mut source_index: HashMap<UnitId, &CandidateVertex> =
        HashMap::with_capacity(local.len() + remote.len());
    for element in local {
        source_index.insert(element.id, element);
    }
    for element in remote {
        source_index.insert(element.id, element);
    }

    let mut arena = VertexArena::default();
    let mut index = HashMap::with_capacity(source_index.len());

    let mut local_ids = Vec::with_capacity(local.len());
    for element in local {
        let vertex = create_vertex(&mut arena, &mut index, &source_index, element);
        arena.vertices[vertex as usize].location = VertexLocation::Local;
        local_ids.push(vertex);
    }

    let mut remote_ids = Vec::with_capacity(remote.len());
    for element in remote {
        let vertex = create_vertex(&mut arena, &mut index, &source_index, element);
        if arena.vertices[vertex as usize].location != VertexLocation::Unknown {
            // Already part of the local set; the local view wins.
            continue;
        }
        arena.vertices[vertex as usize].location = VertexLocation::Remote;
        remote_ids.push(vertex);
    }

    let local_heap = MaxHeap::heapify(local_ids, &mut arena);
    let remote_heap = MaxHeap::heapify(remote_ids, &mut arena);
    (arena, local_heap, remote_heap)
}

#[derive(Debug, Default)]
struct TransferSet {
    give: Vec<UnitId>,
    accept: Vec<UnitId>,
    imbalance: i64,
}

/// Greedily pops from whichever heap offers the higher marginal score,
/// propagating score deltas to connected vertices after every move, until
/// neither direction yields an acceptable move under the tolerance rule.
async fn compute_transfer_set(
    local: Vec<CandidateVertex>,
    remote: Vec<CandidateVertex>,
    mut local_activations: i64,
    mut remote_activations: i64,
    tolerance: &dyn ImbalanceToleranceRule,
) -> TransferSet {
    const YIELD_EVERY: u32 = 128;

    let (mut arena, mut local_heap, mut remote_heap) = build_candidate_heaps(&local, &remote);
    let mut current_imbalance = imbalance(remote_activations, local_activations);
    let mut transfer = TransferSet::default();
    let mut iterations = 0u32;

    loop {
        iterations += 1;
        if iterations % YIELD_EVERY == 0 {
            // Give other tasks a chance periodically.
            tokio::task::yield_now().await;
        }

        let local_score = local_heap.peek().map(|id| arena.score(id)).unwrap_or(0);
        let remote_score = remote_heap.peek().map(|id| arena.score(id)).unwrap_or(0);

        // If more is gained by giving than taking, try giving first; break
        // score ties toward relieving the more loaded side.
        let give_first = local_score > remote_score
            || (local_score == remote_score && local_activations > remote_activations);

        let order = if give_first { [true, false] } else { [false, true] };
        let mut moved = false;
        for giving_local in order {
            if try_move_one(
                &mut arena,
                &mut local_heap,
                &mut remote_heap,
                giving_local,
                &mut local_activations,
                &mut remote_activations,
                &mut current_imbalance,
                tolerance,
                &mut transfer,
            ) {
                moved = true;
                break;
            }
        }
        if !moved {
            break;
        }
    }

    transfer.imbalance = current_imbalance;
    transfer
}

#[allow(clippy::too_many_arguments)]
fn try_move_one(
    arena: &mut VertexArena,
    local_heap: &mut MaxHeap,
    remote_heap: &mut MaxHeap,
    giving_local: bool,
    local_activations: &mut i64,
    remote_activations: &mut i64,
    current_imbalance: &mut i64,
    tolerance: &dyn ImbalanceToleranceRule,
    transfer: &mut TransferSet,
) -> bool {
    let (local_delta, remote_delta) = if giving_local { (-1, 1) } else { (1, -1) };
    let anticipated = imbalance(
        *local_activations + local_delta,
        *remote_activations + remote_delta,
    );
    if anticipated >= *current_imbalance && !tolerance.is_satisfied_by(anticipated as u64) {
        // Taking from this heap would not improve the imbalance.
        return false;
    }

    let source_heap = if giving_local {
        &mut *local_heap
    } else {
        &mut *remote_heap
    };
    let Some(chosen) = source_heap.try_pop(arena) else {
        return false;
    };
    if arena.vertices[chosen as usize].score <= 0 {
        // Deflated by an earlier move; pop and ignore it.
        return false;
    }

    *local_activations += local_delta;
    *remote_activations += remote_delta;
    *current_imbalance = anticipated;
    if giving_local {
        transfer.give.push(arena.vertices[chosen as usize].id);
    } else {
        transfer.accept.push(arena.vertices[chosen as usize].id);
    }

    // The move flips the chosen vertex's side, so each neighbor's edge to it
    // changes classification: what was local traffic becomes remote and
    // vice versa. Adjust the neighbors still resident in either heap.
    let connected = arena.vertices[chosen as usize].connected.clone();
    for (neighbor, weight) in connected {
        match arena.vertices[neighbor as usize].location {
            VertexLocation::Local => {
                if giving_local {
                    arena.vertices[neighbor as usize].score += weight;
                    local_heap.on_increase_priority(neighbor, arena);
                } else {
                    arena.vertices[neighbor as usize].score -= weight;
                    local_heap.on_decrease_priority(neighbor, arena);
                }
            }
            VertexLocation::Remote => {
                if giving_local {
                    arena.vertices[neighbor as usize].score -= weight;
                    remote_heap.on_decrease_priority(neighbor, arena);
                } else {
                    arena.vertices[neighbor as usize].score += weight;
                    remote_heap.on_increase_priority(neighbor, arena);
                }
            }
            VertexLocation::Unknown => {}
        }
    }

    arena.vertices[chosen as usize].location = if giving_local {
        VertexLocation::Remote
    } else {
        VertexLocation::Local
    };
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Vertex;

    const LOCAL: HostId = HostId(1);
    const REMOTE: HostId = HostId(2);
    const OTHER: HostId = HostId(3);

    fn unit(key: u32) -> UnitId {
        UnitId::new(1, key)
    }

    fn vertex(key: u32, host: HostId) -> Vertex {
        Vertex::unit(unit(key), host, true)
    }

    fn add_times(counter: &mut FrequentEdgeCounter, edge: Edge, times: u64) {
        for _ in 0..times {
            counter.add(edge);
        }
    }

    struct FixedTolerance(u64);

    impl ImbalanceToleranceRule for FixedTolerance {
        fn is_satisfied_by(&self, imbalance: u64) -> bool {
            imbalance <= self.0
        }
    }

    #[test]
    fn imbalance_is_symmetric_and_absolute() {
        assert_eq!(imbalance(120, 20), 100);
        assert_eq!(imbalance(20, 120), 100);
        assert_eq!(imbalance(-5, 5), 0);
    }

    #[test]
    fn candidates_require_remote_traffic_to_dominate() {
        let mut counter = FrequentEdgeCounter::new(64);
        // unit 1: 10 remote vs 50 local -> anchored, not a candidate.
        add_times(
            &mut counter,
            Edge::new(vertex(1, LOCAL), vertex(100, REMOTE)),
            10,
        );
        add_times(
            &mut counter,
            Edge::new(vertex(1, LOCAL), vertex(2, LOCAL)),
            50,
        );
        // unit 3: 40 remote vs 5 local -> candidate with score 35.
        add_times(
            &mut counter,
            Edge::new(vertex(3, LOCAL), vertex(101, REMOTE)),
            40,
        );
        add_times(
            &mut counter,
            Edge::new(vertex(3, LOCAL), vertex(2, LOCAL)),
            5,
        );

        let groups = migration_candidates(&counter, LOCAL);
        let candidates = candidates_for_host(&groups, REMOTE);
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert_eq!(candidate.id, unit(3));
        assert_eq!(candidate.accumulated_transfer_score, 35);
        // All partners stay as connected vertices, local ones included.
        assert_eq!(candidate.connected_vertices.len(), 2);

        let anchored = anchored_units(&groups);
        assert!(anchored.contains(&unit(1)));
        assert!(!anchored.contains(&unit(3)));
    }

    #[test]
    fn remote_scores_are_filtered_per_partner_host() {
        let mut counter = FrequentEdgeCounter::new(64);
        add_times(
            &mut counter,
            Edge::new(vertex(1, LOCAL), vertex(100, REMOTE)),
            30,
        );
        add_times(
            &mut counter,
            Edge::new(vertex(1, LOCAL), vertex(200, OTHER)),
            70,
        );

        let groups = migration_candidates(&counter, LOCAL);
        let toward_remote = candidates_for_host(&groups, REMOTE);
        assert_eq!(toward_remote[0].accumulated_transfer_score, 30);
        let toward_other = candidates_for_host(&groups, OTHER);
        assert_eq!(toward_other[0].accumulated_transfer_score, 70);

        let sets = candidate_sets(&groups, LOCAL, &[LOCAL, REMOTE, OTHER]);
        assert_eq!(sets.len(), 2);
        // Ordered descending by total transfer score.
        assert_eq!(sets[0].host, OTHER);
        assert_eq!(sets[0].total_transfer_score, 70);
        assert_eq!(sets[1].host, REMOTE);
    }

    #[test]
    fn inbound_edges_make_the_local_target_a_candidate() {
        let mut counter = FrequentEdgeCounter::new(64);
        // Observed at the receiving host: remote unit 100 calls local unit 1.
        add_times(
            &mut counter,
            Edge::new(vertex(100, REMOTE), vertex(1, LOCAL)),
            25,
        );

        let groups = migration_candidates(&counter, LOCAL);
        let candidates = candidates_for_host(&groups, REMOTE);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, unit(1));
        assert_eq!(candidates[0].accumulated_transfer_score, 25);
    }

    #[test]
    fn unmovable_and_rerouted_edges_are_not_candidates() {
        let mut counter = FrequentEdgeCounter::new(64);
        let immovable = Vertex::unit(unit(9), LOCAL, false);
        add_times(&mut counter, Edge::new(immovable, vertex(100, REMOTE)), 40);
        // Rerouted: neither endpoint on the observing host.
        add_times(
            &mut counter,
            Edge::new(vertex(50, REMOTE), vertex(60, OTHER)),
            40,
        );

        let groups = migration_candidates(&counter, LOCAL);
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn transfer_set_balances_a_lopsided_pair() {
        // 10 local units all chatting with the remote host; the remote side
        // offers nothing. Local host is heavily loaded.
        let local: Vec<CandidateVertex> = (0..10)
            .map(|key| CandidateVertex {
                id: unit(key),
                accumulated_transfer_score: 100 - i64::from(key),
                connected_vertices: Vec::new(),
            })
            .collect();

        let transfer =
            compute_transfer_set(local, Vec::new(), 20, 10, &FixedTolerance(4)).await;

        // Gives until the imbalance flips within tolerance: 20/10 -> 15/15
        // is reachable, then every further move stops improving.
        assert!(!transfer.give.is_empty());
        assert!(transfer.accept.is_empty());
        assert!(transfer.imbalance <= 10);
        // Highest scores go first.
        assert_eq!(transfer.give[0], unit(0));
    }

    #[tokio::test]
    async fn connected_vertices_deflate_and_stop_ping_pong() {
        // Local unit 1 and remote unit 2 talk to each other exclusively.
        // Accepting one must deflate the other's score so only one moves.
        let local = vec![CandidateVertex {
            id: unit(1),
            accumulated_transfer_score: 50,
            connected_vertices: vec![ConnectedVertex {
                id: unit(2),
                transfer_score: 50,
            }],
        }];
        let remote = vec![CandidateVertex {
            id: unit(2),
            accumulated_transfer_score: 60,
            connected_vertices: vec![ConnectedVertex {
                id: unit(1),
                transfer_score: 50,
            }],
        }];

        let transfer = compute_transfer_set(local, remote, 10, 10, &FixedTolerance(10)).await;

        assert_eq!(transfer.accept, vec![unit(2)]);
        assert!(
            transfer.give.is_empty(),
            "unit 1 must not bounce back once its partner became local"
        );
    }

    #[tokio::test]
    async fn tolerance_rule_caps_one_sided_transfers() {
        let local: Vec<CandidateVertex> = (0..50)
            .map(|key| CandidateVertex {
                id: unit(key),
                accumulated_transfer_score: 10,
                connected_vertices: Vec::new(),
            })
            .collect();

        // Equal load: every give worsens imbalance, so only the tolerance
        // allows movement.
        let transfer =
            compute_transfer_set(local, Vec::new(), 100, 100, &FixedTolerance(6)).await;
        assert_eq!(transfer.give.len(), 3, "stops at the tolerance boundary");
        assert_eq!(transfer.imbalance, 6);
    }

    #[tokio::test]
    async fn zero_score_vertices_are_discarded_without_moving() {
        let local = vec![CandidateVertex {
            id: unit(1),
            accumulated_transfer_score: 0,
            connected_vertices: Vec::new(),
        }];
        let transfer = compute_transfer_set(local, Vec::new(), 50, 10, &FixedTolerance(10)).await;
        assert!(transfer.give.is_empty());
        assert!(transfer.accept.is_empty());
    }

    #[test]
    fn duplicate_ids_across_sets_keep_the_local_view() {
        let local = vec![CandidateVertex {
            id: unit(1),
            accumulated_transfer_score: 5,
            connected_vertices: Vec::new(),
        }];
        let remote = vec![CandidateVertex {
            id: unit(1),
            accumulated_transfer_score: 9,
            connected_vertices: Vec::new(),
        }];
        let (arena, local_heap, remote_heap) = build_candidate_heaps(&local, &remote);
        assert_eq!(local_heap.len(), 1);
        assert_eq!(remote_heap.len(), 0);
        assert_eq!(arena.vertices.len(), 1);
    }
}
