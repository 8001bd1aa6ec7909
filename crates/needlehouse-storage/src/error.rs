//! Storage Error Types
//!
//! Storage operations return `Result<T>` aliased to `Result<T, Error>`.
//! Core errors (`not-found`, `corrupt`, write rejections) pass through via
//! `#[from]` so handlers can match on `needlehouse_core::Error` for status
//! mapping; everything specific to this layer gets its own variant.

use needlehouse_core::needle::VolumeId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] needlehouse_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("volume {0} not found")]
    VolumeNotFound(VolumeId),

    #[error("volume {0} already exists")]
    VolumeExists(VolumeId),

    #[error("volume {0} is compacting")]
    Compacting(VolumeId),

    #[error("no compaction in progress for volume {0}")]
    NotCompacting(VolumeId),

    #[error("all data directories are at max volume count")]
    NoFreeLocation,

    #[error("sync with {peer} failed after {attempts} attempts: {last}")]
    SyncExhausted {
        peer: String,
        attempts: u32,
        last: String,
    },

    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl Error {
    /// True when the underlying cause is `not-found`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Core(needlehouse_core::Error::NotFound))
    }
}
