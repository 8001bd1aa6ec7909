//! The 8-byte volume superblock.
//!
//! The first [`SUPERBLOCK_SIZE`] bytes of every `.dat` file:
//!
//! ```text
//! ┌─────────┬───────────────────┬────────┬──────────────────┬──────────┐
//! │ Version │ ReplicaPlacement  │ TTL    │ CompactRevision  │ Reserved │
//! │ (1 B)   │ (1 B)             │ (2 B)  │ (2 B)            │ (2 B)    │
//! └─────────┴───────────────────┴────────┴──────────────────┴──────────┘
//! ```
//!
//! The compact revision is the only mutable field; it is bumped by writing
//! the whole superblock into the compaction scratch file, never in place,
//! so a crashed compaction can't leave a half-updated header behind.

use needlehouse_core::{Error, ReplicaPlacement, Result, Ttl, CURRENT_VERSION};

pub const SUPERBLOCK_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: u8,
    pub replica_placement: ReplicaPlacement,
    pub ttl: Ttl,
    pub compact_revision: u16,
}

impl SuperBlock {
    pub fn new(replica_placement: ReplicaPlacement, ttl: Ttl) -> Self {
        Self {
            version: CURRENT_VERSION,
            replica_placement,
            ttl,
            compact_revision: 0,
        }
    }

    pub fn to_bytes(self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        buf[0] = self.version;
        buf[1] = self.replica_placement.to_byte();
        buf[2..4].copy_from_slice(&self.ttl.to_bytes());
        buf[4..6].copy_from_slice(&self.compact_revision.to_be_bytes());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(Error::Corrupt("superblock shorter than 8 bytes".into()));
        }
        if buf[0] != CURRENT_VERSION {
            return Err(Error::UnsupportedVersion(buf[0]));
        }
        Ok(Self {
            version: buf[0],
            replica_placement: ReplicaPlacement::from_byte(buf[1]),
            ttl: Ttl::from_bytes([buf[2], buf[3]]),
            compact_revision: u16::from_be_bytes([buf[4], buf[5]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let sb = SuperBlock {
            version: CURRENT_VERSION,
            replica_placement: ReplicaPlacement::parse("110").unwrap(),
            ttl: Ttl::parse("3d").unwrap(),
            compact_revision: 42,
        };
        assert_eq!(SuperBlock::parse(&sb.to_bytes()).unwrap(), sb);
    }

    #[test]
    fn test_rejects_future_version() {
        let mut bytes = SuperBlock::new(ReplicaPlacement::default(), Ttl::NONE).to_bytes();
        bytes[0] = 9;
        assert!(matches!(
            SuperBlock::parse(&bytes),
            Err(Error::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_rejects_short_buffer() {
        assert!(SuperBlock::parse(&[3, 0, 0]).is_err());
    }
}
