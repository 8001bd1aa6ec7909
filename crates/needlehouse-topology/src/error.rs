//! Topology and placement errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no writable volume for collection {collection:?} replication {replication}")]
    NoWritableVolume {
        collection: String,
        replication: String,
    },

    #[error("volume {0} has no known location")]
    VolumeNotRegistered(u32),

    #[error("insufficient placement capacity at {level} level: need {needed}, have {available}")]
    InsufficientPlacement {
        level: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("unknown data center {0}")]
    UnknownDataCenter(String),

    #[error("sequencer unavailable: {0}")]
    SequencerUnavailable(String),
}
