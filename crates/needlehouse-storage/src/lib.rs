//! Volume storage layer for NeedleHouse.
//!
//! One volume server process owns a [`Store`], which owns many [`Volume`]s
//! spread over the configured data directories. A volume is an append-only
//! `.dat` file (superblock + needle records) plus an append-only `.idx`
//! journal that makes the in-memory needle index recoverable.
//!
//! ## Modules
//! - [`index`]: pluggable needle-id → (offset, size) maps and the `.idx` codec
//! - [`superblock`]: the 8-byte volume header
//! - [`volume`]: read/write/delete plus two-phase compaction
//! - [`store`]: per-node volume collection and heartbeat inventory
//! - [`sync`]: pairwise incremental replication between volumes of one id
//! - [`grpc`]: the volume server's RPC service on top of a store

pub mod error;
pub mod grpc;
pub mod index;
pub mod store;
pub mod superblock;
pub mod sync;
pub mod volume;

pub use error::{Error, Result};
pub use grpc::VolumeRpcService;
pub use index::{IndexEntry, IndexKind, NeedleIndex, TOMBSTONE_SIZE};
pub use store::{Location, Store, StoreIdentity, VolumeStatus};
pub use superblock::SuperBlock;
pub use sync::{follow, synchronize, SyncConfig};
pub use volume::{SyncPolicy, Volume, VolumeOptions};
