//! Core types shared by every NeedleHouse component.
//!
//! This crate defines the vocabulary of the system:
//! - [`Needle`]: one immutable stored object and its on-disk codec
//! - [`FileId`]: the external address of a needle (`"3,01637037d6"`)
//! - [`Ttl`]: compact two-byte time-to-live representation
//! - [`ReplicaPlacement`]: the three-digit copy-diversity triple
//! - [`Error`]: the error vocabulary shared across crates
//!
//! Everything here is plain data with no I/O; the storage, topology and
//! master crates build on top of it.

pub mod error;
pub mod file_id;
pub mod needle;
pub mod replica_placement;
pub mod ttl;

pub use error::{Error, Result};
pub use file_id::FileId;
pub use needle::{Needle, NeedleId, VolumeId, CURRENT_VERSION, NEEDLE_PADDING};
pub use replica_placement::ReplicaPlacement;
pub use ttl::Ttl;
