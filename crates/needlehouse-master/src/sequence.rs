//! Raft-backed needle-id sequencer.
//!
//! Each reservation is a [`Command::ReserveSequence`] entry in the
//! replicated log, so a range handed to a client is durable before the
//! client sees it and a newly promoted leader continues from the applied
//! maximum rather than re-issuing ids.

use std::sync::Arc;

use async_trait::async_trait;
use needlehouse_topology::Sequencer;

use crate::consensus::{Command, ConsensusLog};
use crate::error::Error;

pub struct RaftSequencer {
    consensus: Arc<dyn ConsensusLog>,
}

impl RaftSequencer {
    pub fn new(consensus: Arc<dyn ConsensusLog>) -> Self {
        Self { consensus }
    }
}

#[async_trait]
impl Sequencer for RaftSequencer {
    async fn next_batch(&self, count: u64) -> needlehouse_topology::Result<u64> {
        let count = count.max(1);
        let state = self
            .consensus
            .propose(Command::ReserveSequence { amount: count })
            .await
            .map_err(|err: Error| {
                needlehouse_topology::Error::SequencerUnavailable(err.to_string())
            })?;
        Ok(state.sequence_max - count + 1)
    }

    async fn peek(&self) -> u64 {
        self.consensus.applied_state().sequence_max
    }
}
