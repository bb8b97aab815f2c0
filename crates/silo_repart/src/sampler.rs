//! Best-effort sampling of the message-send hot path.
//!
//! Producers run on whatever thread is delivering a message and must never
//! block or slow delivery: each observation is `try_send`-pushed into one of
//! several striped bounded queues and silently dropped when its stripe is
//! full. A single consumer (the engine's serialized context) drains the
//! stripes, classifies observations into communication edges, and feeds the
//! frequency sketch.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::bloom::BlockedBloomFilter;
use crate::ids::{Edge, HostId, UnitId, Vertex};

/// Kind of an observed message; only requests are sampled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    System,
}

/// One observation captured on the send path. Hosts are `None` when the
/// message was not yet fully addressed at observation time.
#[derive(Clone, Copy, Debug)]
pub struct SampledMessage {
    pub kind: MessageKind,
    pub source_unit: UnitId,
    pub source_host: Option<HostId>,
    pub target_unit: UnitId,
    pub target_host: Option<HostId>,
}

impl SampledMessage {
    pub fn request(source: (UnitId, HostId), target: (UnitId, HostId)) -> Self {
        Self {
            kind: MessageKind::Request,
            source_unit: source.0,
            source_host: Some(source.1),
            target_unit: target.0,
            target_host: Some(target.1),
        }
    }
}

/// Movability of both endpoints of an eligible message.
#[derive(Clone, Copy, Debug)]
pub struct EndpointMovability {
    pub source: bool,
    pub target: bool,
}

/// Decides whether an observed message takes part in repartitioning and
/// whether its endpoints' types are movable.
pub trait MessageFilter: Send + Sync {
    /// `None` excludes the message from sampling entirely.
    fn classify(&self, message: &SampledMessage) -> Option<EndpointMovability>;
}

/// Movability derived from the unit's type id: client proxies, system
/// targets, single-instance types, and explicitly immovable types are all
/// registered as immovable type ids.
#[derive(Default)]
pub struct TypeMovabilityFilter {
    immovable_types: std::collections::HashSet<u32>,
}

impl TypeMovabilityFilter {
    pub fn new(immovable_types: impl IntoIterator<Item = u32>) -> Self {
        Self {
            immovable_types: immovable_types.into_iter().collect(),
        }
    }

    fn movable(&self, unit: UnitId) -> bool {
        !unit.is_host_surrogate() && !self.immovable_types.contains(&unit.type_id())
    }
}

impl MessageFilter for TypeMovabilityFilter {
    fn classify(&self, message: &SampledMessage) -> Option<EndpointMovability> {
        if message.kind != MessageKind::Request {
            return None;
        }
        if message.source_host.is_none() || message.target_host.is_none() {
            return None;
        }
        Some(EndpointMovability {
            source: self.movable(message.source_unit),
            target: self.movable(message.target_unit),
        })
    }
}

/// Relaxed counters describing sampler throughput.
#[derive(Default)]
pub struct SamplerStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplerStatsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub processed: u64,
}

impl SamplerStats {
    pub fn snapshot(&self) -> SamplerStatsSnapshot {
        SamplerStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }
}

/// Producer half: cheap, non-blocking, safe to call from any thread.
#[derive(Clone)]
pub struct MessageSampler {
    stripes: Arc<[mpsc::Sender<SampledMessage>]>,
    notify: Arc<Notify>,
    enabled: Arc<AtomicBool>,
    stats: Arc<SamplerStats>,
}

impl MessageSampler {
    /// Records one observation. Drops it when sampling is disabled, the
    /// message is not a fully-addressed request, or the stripe is full.
    pub fn record(&self, message: SampledMessage) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if message.kind != MessageKind::Request
            || message.source_host.is_none()
            || message.target_host.is_none()
        {
            return;
        }
        let stripe = stripe_for_current_thread(self.stripes.len());
        match self.stripes[stripe].try_send(message) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SamplerStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Consumer half, owned by the engine task.
pub struct SamplerConsumer {
    receivers: Vec<mpsc::Receiver<SampledMessage>>,
    notify: Arc<Notify>,
    stats: Arc<SamplerStats>,
}

impl SamplerConsumer {
    /// Resolves when new observations may be available. A permit stored by a
    /// producer while the consumer was busy resolves the next call
    /// immediately, so no wakeup is lost.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Re-arms the wakeup so draining resumes on the next loop pass. Used to
    /// bound the work done per wakeup without busy-polling.
    pub fn renotify(&self) {
        self.notify.notify_one();
    }

    /// Moves up to `max` observations into `out`, visiting every stripe.
    /// Returns whether a stripe may still hold more.
    pub fn drain_into(&mut self, out: &mut Vec<SampledMessage>, max: usize) -> bool {
        let start = out.len();
        let mut more = false;
        'stripes: for receiver in &mut self.receivers {
            loop {
                if out.len() >= max {
                    more = true;
                    break 'stripes;
                }
                match receiver.try_recv() {
                    Ok(message) => out.push(message),
                    Err(_) => break,
                }
            }
        }
        self.stats
            .processed
            .fetch_add((out.len() - start) as u64, Ordering::Relaxed);
        more
    }

    /// Discards everything currently buffered.
    pub fn purge(&mut self) {
        for receiver in &mut self.receivers {
            while receiver.try_recv().is_ok() {}
        }
    }
}

/// Builds the striped buffer. Stripe count follows the processor count so
/// concurrent producers rarely contend on the same queue.
pub fn channel(max_unprocessed: usize) -> (MessageSampler, SamplerConsumer) {
    let stripes = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    channel_with_stripes(max_unprocessed, stripes)
}

pub fn channel_with_stripes(
    max_unprocessed: usize,
    stripes: usize,
) -> (MessageSampler, SamplerConsumer) {
    let stripes = stripes.max(1);
    let per_stripe = (max_unprocessed / stripes).max(1);
    let mut senders = Vec::with_capacity(stripes);
    let mut receivers = Vec::with_capacity(stripes);
    for _ in 0..stripes {
        let (tx, rx) = mpsc::channel(per_stripe);
        senders.push(tx);
        receivers.push(rx);
    }
    let notify = Arc::new(Notify::new());
    let stats = Arc::new(SamplerStats::default());
    (
        MessageSampler {
            stripes: senders.into(),
            notify: Arc::clone(&notify),
            enabled: Arc::new(AtomicBool::new(false)),
            stats: Arc::clone(&stats),
        },
        SamplerConsumer {
            receivers,
            notify,
            stats,
        },
    )
}

fn stripe_for_current_thread(stripe_count: usize) -> usize {
    static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static STRIPE: usize = NEXT_STRIPE.fetch_add(1, Ordering::Relaxed);
    }
    STRIPE.with(|stripe| *stripe % stripe_count)
}

/// Classifies one observation into the edges fed to the frequency sketch.
///
/// Unmovable endpoints, and local endpoints already anchored, are folded
/// into their host's surrogate vertex so their communication mass stays
/// visible without tracking partners that can never move. Fully collapsed
/// pairs (both sides the same surrogate) and self-edges are dropped. When
/// both endpoints are local movable units the edge is recorded from both
/// perspectives, since either unit may independently become a migration
/// candidate.
pub(crate) fn classify(
    message: &SampledMessage,
    local_host: HostId,
    filter: &dyn MessageFilter,
    anchored: Option<&BlockedBloomFilter>,
) -> [Option<Edge>; 2] {
    const NOTHING: [Option<Edge>; 2] = [None, None];

    let (Some(source_host), Some(target_host)) = (message.source_host, message.target_host)
    else {
        return NOTHING;
    };
    let Some(movability) = filter.classify(message) else {
        return NOTHING;
    };
    if !movability.source && !movability.target {
        return NOTHING;
    }

    let fold = |id: UnitId, host: HostId, movable: bool| -> Vertex {
        let anchored_locally = host == local_host
            && anchored.is_some_and(|filter| filter.contains(&id));
        if movable && !anchored_locally {
            Vertex::unit(id, host, true)
        } else {
            Vertex::host_surrogate(host)
        }
    };

    let source = fold(message.source_unit, source_host, movability.source);
    let target = fold(message.target_unit, target_host, movability.target);
    let edge = Edge::new(source, target);
    if edge.is_self_edge() {
        return NOTHING;
    }

    let both_local_units =
        source.host == local_host && target.host == local_host && source.movable && target.movable;
    let flipped = both_local_units.then(|| edge.flipped());
    [Some(edge), flipped]
}
