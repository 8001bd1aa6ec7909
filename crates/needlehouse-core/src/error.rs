//! Error Types for NeedleHouse
//!
//! This module defines the error vocabulary shared across NeedleHouse crates.
//!
//! ## Error Categories
//!
//! ### Lookup Errors
//! - `NotFound`: unknown volume or needle (surfaced as HTTP 404 / gRPC NOT_FOUND)
//!
//! ### Data Integrity Errors
//! - `CrcMismatch`: body checksum does not match the trailer
//! - `Corrupt`: a record could not be decoded (bad sizes, truncated stream)
//! - `UnsupportedVersion`: superblock or needle written by a newer format
//!
//! ### Write Rejections
//! - `VolumeReadOnly` / `VolumeFull`: returned to writers; the master stops
//!   directing traffic to the volume on the next heartbeat
//!
//! ### Coordination Errors
//! - `CompactRevisionMismatch`: a replica holds offsets from a compaction
//!   generation that no longer exists; the sync engine restarts from snapshot
//! - `NotLeader`: the mutating request reached a follower; carries the leader
//!   address when known
//!
//! ## Usage
//! All fallible functions return `Result<T>` aliased to `Result<T, Error>`,
//! so errors propagate with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("CRC mismatch")]
    CrcMismatch,

    #[error("volume {0} is read-only")]
    VolumeReadOnly(u32),

    #[error("volume {0} is full")]
    VolumeFull(u32),

    #[error("compact revision mismatch: expected {expected}, actual {actual}")]
    CompactRevisionMismatch { expected: u16, actual: u16 },

    #[error("not the leader{}", .0.as_deref().map(|l| format!(", leader is {l}")).unwrap_or_default())]
    NotLeader(Option<String>),

    #[error("invalid file id: {0}")]
    InvalidFid(String),

    #[error("invalid replica placement: {0}")]
    InvalidReplicaPlacement(String),

    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is worth retrying on another replica or attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Internal(_))
    }
}
