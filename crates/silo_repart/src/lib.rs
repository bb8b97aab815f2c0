//! Continuous activation repartitioning for a distributed actor runtime.
//!
//! Hosts observe which of their units talk to which remote units, score each
//! movable unit by how much cross-host traffic moving it would eliminate,
//! and periodically negotiate pairwise exchanges so chatty units end up
//! co-located. The moving parts:
//!
//! - [`sampler`]: non-blocking sampling of the message-send hot path into a
//!   striped bounded buffer.
//! - [`frequency`]: a Space-Saving sketch tracking the heaviest
//!   communication edges in bounded memory.
//! - [`bloom`]: a blocked Bloom filter remembering units that were found
//!   uneconomical to move.
//! - [`heap`]: the max-heap driving greedy transfer-set selection.
//! - [`tolerance`]: how much activation-count imbalance an exchange may
//!   introduce.
//! - [`engine`]: the per-host protocol engine tying it all together.
//!
//! Placement, membership, and message routing stay outside; they are
//! consumed through the narrow traits in [`directory`], [`membership`], and
//! [`transport`].

pub mod bloom;
pub mod directory;
pub mod engine;
pub mod frequency;
pub mod heap;
pub mod ids;
pub mod membership;
pub mod options;
pub mod sampler;
pub mod tolerance;
pub mod transport;

pub use engine::{spawn, EngineStatus, HostRuntime, RepartitionerHandle};
pub use ids::{CandidateVertex, ConnectedVertex, Direction, Edge, HostId, UnitId, Vertex};
pub use options::RepartitionerOptions;
pub use sampler::{MessageFilter, MessageKind, MessageSampler, SampledMessage};
pub use transport::{AcceptExchangeRequest, AcceptExchangeResponse, ExchangeTransport};
