//! File ids — the external address of a needle.
//!
//! A file id is rendered as `"<volume_id>,<needle_id_hex><cookie_hex>"`,
//! e.g. `3,01637037d6`. The needle id hex drops leading zero byte pairs
//! (but always keeps at least one pair); the cookie is always exactly 8 hex
//! digits. Clients treat the whole string as opaque; only volume servers
//! ever take it apart.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::needle::{NeedleId, VolumeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub volume_id: VolumeId,
    pub needle_id: NeedleId,
    pub cookie: u32,
}

impl FileId {
    pub fn new(volume_id: VolumeId, needle_id: NeedleId, cookie: u32) -> Self {
        Self {
            volume_id,
            needle_id,
            cookie,
        }
    }

    /// Parse `"<vid>,<key_hex><cookie_hex>"`.
    pub fn parse(s: &str) -> Result<Self> {
        let (vid, rest) = s
            .split_once(',')
            .ok_or_else(|| Error::InvalidFid(s.to_string()))?;
        let volume_id: VolumeId = vid.parse().map_err(|_| Error::InvalidFid(s.to_string()))?;
        if rest.len() <= 8 || rest.len() > 24 {
            return Err(Error::InvalidFid(s.to_string()));
        }
        let (key_hex, cookie_hex) = rest.split_at(rest.len() - 8);
        let needle_id =
            NeedleId::from_str_radix(key_hex, 16).map_err(|_| Error::InvalidFid(s.to_string()))?;
        let cookie =
            u32::from_str_radix(cookie_hex, 16).map_err(|_| Error::InvalidFid(s.to_string()))?;
        Ok(Self {
            volume_id,
            needle_id,
            cookie,
        })
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Trim leading zero byte pairs from the key hex, keeping one pair.
        let key = self.needle_id.to_be_bytes();
        let first = key
            .iter()
            .position(|b| *b != 0)
            .unwrap_or(key.len() - 1);
        write!(f, "{},", self.volume_id)?;
        for b in &key[first..] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "{:08x}", self.cookie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_trims_leading_zero_pairs() {
        let fid = FileId::new(3, 0x01, 0x637037d6);
        assert_eq!(fid.to_string(), "3,01637037d6");
    }

    #[test]
    fn test_display_wide_key() {
        let fid = FileId::new(7, 0x0102030405060708, 0xdeadbeef);
        assert_eq!(fid.to_string(), "7,0102030405060708deadbeef");
    }

    #[test]
    fn test_parse_round_trip() {
        for fid in [
            FileId::new(1, 1, 0),
            FileId::new(3, 0x01, 0x637037d6),
            FileId::new(u32::MAX, u64::MAX, u32::MAX),
        ] {
            assert_eq!(FileId::parse(&fid.to_string()).unwrap(), fid);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "3",
            "3,",
            "3,abcd",          // too short for a cookie
            "x,01637037d6",    // bad volume id
            "3,zz637037d6zz",  // bad hex
            "3,0102030405060708090a0b0c0deadbeef", // too long
        ] {
            assert!(FileId::parse(bad).is_err(), "{} should not parse", bad);
        }
    }
}
