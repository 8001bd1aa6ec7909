//! Consensus Log Abstraction
//!
//! Everything the master must not lose across a leader change flows
//! through one replicated log: sequence reservations and volume-id
//! assignments. The log is abstract ([`ConsensusLog`]) so the HTTP and
//! gRPC layers never talk to Raft directly; [`crate::raft::RaftNode`] is
//! the production implementation and [`MemoryLog`] backs unit tests and
//! embedded single-process setups.
//!
//! The topology tree itself is deliberately *not* replicated: it is soft
//! state rebuilt from volume-server heartbeats within one pulse of a
//! leader change. Only the counters that must never run backwards live in
//! the log.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Result;

/// One replicated state-machine command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Committed by a new leader to learn the commit frontier.
    Noop,
    /// Reserve `amount` needle ids; the post-apply `sequence_max` is the
    /// end of the reserved range.
    ReserveSequence { amount: u64 },
    /// A growth decision claimed this volume id.
    AssignVolumeId { volume_id: u32 },
}

/// The replicated state: counters that must survive leader changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterState {
    /// Highest needle id ever reserved.
    pub sequence_max: u64,
    /// Highest volume id ever assigned.
    pub max_volume_id: u32,
}

impl MasterState {
    pub fn apply(&mut self, command: &Command) {
        match command {
            Command::Noop => {}
            Command::ReserveSequence { amount } => self.sequence_max += amount,
            Command::AssignVolumeId { volume_id } => {
                self.max_volume_id = self.max_volume_id.max(*volume_id)
            }
        }
    }
}

/// Leadership as observed by this node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderState {
    pub is_leader: bool,
    /// `ip:port` HTTP address of the known leader, if any.
    pub leader: Option<String>,
}

/// The seam between the master and its consensus implementation.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Append a command, wait for it to commit and apply, and return the
    /// state immediately after applying it. Fails with `NotLeader` on
    /// followers.
    async fn propose(&self, command: Command) -> Result<MasterState>;

    /// State as of the last applied entry.
    fn applied_state(&self) -> MasterState;

    fn is_leader(&self) -> bool;

    /// HTTP address of the current leader, if known.
    fn leader_hint(&self) -> Option<String>;

    /// Watch leadership changes (promotion, demotion, new leader hints).
    fn subscribe_leadership(&self) -> watch::Receiver<LeaderState>;
}

/// In-process log with no peers and no disk: always the leader, applies
/// immediately. For tests and the embedded single-master mode.
pub struct MemoryLog {
    state: Mutex<MasterState>,
    leadership: watch::Sender<LeaderState>,
    address: String,
}

impl MemoryLog {
    pub fn new(address: &str) -> Self {
        let (leadership, _) = watch::channel(LeaderState {
            is_leader: true,
            leader: Some(address.to_string()),
        });
        Self {
            state: Mutex::new(MasterState::default()),
            leadership,
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl ConsensusLog for MemoryLog {
    async fn propose(&self, command: Command) -> Result<MasterState> {
        let mut state = self.state.lock();
        state.apply(&command);
        Ok(*state)
    }

    fn applied_state(&self) -> MasterState {
        *self.state.lock()
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader_hint(&self) -> Option<String> {
        Some(self.address.clone())
    }

    fn subscribe_leadership(&self) -> watch::Receiver<LeaderState> {
        self.leadership.subscribe()
    }
}
