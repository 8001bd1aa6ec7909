//! Cluster topology for the NeedleHouse master.
//!
//! The master's picture of the world is a four-level tree:
//!
//! ```text
//! Topology ─→ DataCenter ─→ Rack ─→ DataNode (volume server)
//! ```
//!
//! Nodes live in one arena ([`arena`]) and refer to each other by id, so
//! parent and child links never form owning cycles. The tree is fed by
//! volume-server heartbeats and consumed by write placement
//! ([`Topology::pick_for_write`]) and volume growth ([`growth`]).

pub mod arena;
pub mod error;
pub mod growth;
pub mod sequence;
pub mod topology;

pub use arena::{Arena, NodeId, NodeKind};
pub use error::{Error, Result};
pub use growth::{VolumeGrowOption, VolumeGrowth};
pub use sequence::{MemorySequencer, Sequencer};
pub use topology::{
    HeartbeatDelta, HeartbeatInfo, LayoutKey, Location, Topology, VolumeInfo, WriteOption,
};
