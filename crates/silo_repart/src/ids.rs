//! Identities and the communication-graph data model.

use std::fmt;
use std::hash::{Hash, Hasher};

use rapidhash::RapidHasher;
use serde::{Deserialize, Serialize};

/// Cluster host identity.
///
/// Ordered so the exchange protocol can break mutual-exchange ties by
/// comparing addresses.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HostId(pub u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

/// Bit marking a [`UnitId`] as a host surrogate rather than a real unit.
const HOST_SURROGATE_BIT: u64 = 1 << 63;

/// Addressable unit identity: a 30-bit type id plus a 32-bit key.
///
/// The top bit is reserved for *host surrogates*: synthetic ids standing in
/// for "everything on host X" when an edge endpoint is unmovable or anchored.
/// Surrogates keep per-host communication mass visible to the scoring pass
/// without tracking partners that can never migrate.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnitId(u64);

impl UnitId {
    pub fn new(type_id: u32, key: u32) -> Self {
        debug_assert!(u64::from(type_id) < (1 << 30), "type id must fit in 30 bits");
        Self((u64::from(type_id) << 32) | u64::from(key))
    }

    /// Synthetic id representing the given host as a whole.
    pub fn host_surrogate(host: HostId) -> Self {
        Self(HOST_SURROGATE_BIT | host.0)
    }

    pub fn is_host_surrogate(&self) -> bool {
        self.0 & HOST_SURROGATE_BIT != 0
    }

    pub fn type_id(&self) -> u32 {
        ((self.0 >> 32) & 0x3fff_ffff) as u32
    }

    pub fn key(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host_surrogate() {
            write!(f, "surrogate/host-{}", self.0 & !HOST_SURROGATE_BIT)
        } else {
            write!(f, "unit-{}/{}", self.type_id(), self.key())
        }
    }
}

/// One endpoint of an observed communication edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vertex {
    pub id: UnitId,
    pub host: HostId,
    pub movable: bool,
}

impl Vertex {
    pub fn unit(id: UnitId, host: HostId, movable: bool) -> Self {
        Self { id, host, movable }
    }

    /// The immovable vertex standing in for the host itself.
    pub fn host_surrogate(host: HostId) -> Self {
        Self {
            id: UnitId::host_surrogate(host),
            host,
            movable: false,
        }
    }
}

/// A directed communication relationship between two vertices, keyed into the
/// frequency sketch. Self-edges are rejected at ingestion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: Vertex,
    pub target: Vertex,
}

impl Edge {
    pub fn new(source: Vertex, target: Vertex) -> Self {
        Self { source, target }
    }

    pub fn is_self_edge(&self) -> bool {
        self.source.id == self.target.id
    }

    pub fn flipped(&self) -> Self {
        Self {
            source: self.target,
            target: self.source,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} -> {}@{}",
            self.source.id, self.source.host, self.target.id, self.target.host
        )
    }
}

/// Direction of an edge relative to an observing host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    LocalToLocal,
    LocalToRemote,
    RemoteToLocal,
}

impl Edge {
    /// Classifies this edge relative to `observer`. `None` when neither
    /// endpoint is local, which can happen for traffic re-routed through the
    /// observing host.
    pub fn direction_from(&self, observer: HostId) -> Option<Direction> {
        match (self.source.host == observer, self.target.host == observer) {
            (true, true) => Some(Direction::LocalToLocal),
            (true, false) => Some(Direction::LocalToRemote),
            (false, true) => Some(Direction::RemoteToLocal),
            (false, false) => None,
        }
    }
}

/// A connected partner of a candidate vertex, with the weight of that single
/// edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedVertex {
    pub id: UnitId,
    pub transfer_score: u64,
}

/// A movable local unit offered during an exchange round.
///
/// `accumulated_transfer_score` is the estimated remote-edge weight toward
/// the exchange partner minus the unit's local-edge weight; only units with a
/// positive score are offered. Candidates are rebuilt from the sketch every
/// round and have no identity across rounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateVertex {
    pub id: UnitId,
    pub accumulated_transfer_score: i64,
    pub connected_vertices: Vec<ConnectedVertex>,
}

/// Seeded 64-bit hash shared by the sketch buckets and the anchoring filter.
pub(crate) fn hash64<T: Hash>(value: &T, seed: u64) -> u64 {
    let mut hasher = RapidHasher::new(seed);
    value.hash(&mut hasher);
    hasher.finish()
}
