//! NeedleHouse master: the leader-elected control plane.
//!
//! The master answers three questions:
//! - *where do I write?* — `/dir/assign` picks a writable volume and mints
//!   a file id from the replicated sequencer
//! - *where do I read?* — `/dir/lookup` maps a volume id to its replicas
//! - *how does the cluster stay healthy?* — growth, vacuum scheduling and
//!   dead-node eviction
//!
//! Followers proxy mutating requests to the leader; leadership comes from
//! the Raft implementation in [`raft`] behind the [`consensus::ConsensusLog`]
//! seam.

pub mod config;
pub mod consensus;
pub mod error;
pub mod grpc;
pub mod notifications;
pub mod raft;
pub mod refresher;
pub mod sequence;
pub mod server;

pub use config::{grpc_endpoint, MasterConfig};
pub use consensus::{Command, ConsensusLog, LeaderState, MasterState, MemoryLog};
pub use error::{Error, Result};
pub use grpc::MasterRpcService;
pub use notifications::NotificationBus;
pub use raft::{RaftConfig, RaftNode, RaftService};
pub use refresher::start_refresh;
pub use sequence::RaftSequencer;
pub use server::{AssignParams, AssignResult, Master};
