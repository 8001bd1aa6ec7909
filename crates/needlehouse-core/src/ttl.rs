//! Time-to-live representation.
//!
//! A TTL is stored in two bytes: a count and a unit. That keeps the needle
//! record and the superblock compact while still expressing everything from
//! minutes to months. `Ttl::NONE` (all zeroes) means the data never expires.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Unit byte values for the two-byte TTL codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum TtlUnit {
    #[default]
    Empty = 0,
    Minute = 1,
    Hour = 2,
    Day = 3,
    Week = 4,
    Month = 5,
}

/// Compact time-to-live: count plus unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Ttl {
    pub count: u8,
    pub unit: TtlUnit,
}

impl Ttl {
    /// No expiry.
    pub const NONE: Ttl = Ttl {
        count: 0,
        unit: TtlUnit::Empty,
    };

    /// Parse a string like `"3d"`, `"12h"`, `"1M"`. Empty input means no TTL.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Ttl::NONE);
        }
        let (digits, unit) = match s.char_indices().last() {
            Some((idx, c)) if c.is_ascii_alphabetic() => (&s[..idx], Some(c)),
            _ => (s, None),
        };
        let count: u8 = digits
            .parse()
            .map_err(|_| Error::InvalidTtl(s.to_string()))?;
        let unit = match unit {
            None | Some('m') => TtlUnit::Minute,
            Some('h') => TtlUnit::Hour,
            Some('d') => TtlUnit::Day,
            Some('w') => TtlUnit::Week,
            Some('M') => TtlUnit::Month,
            Some(_) => return Err(Error::InvalidTtl(s.to_string())),
        };
        if count == 0 {
            return Ok(Ttl::NONE);
        }
        Ok(Ttl { count, unit })
    }

    /// Two-byte codec used in needle records and the superblock.
    pub fn to_bytes(self) -> [u8; 2] {
        [self.count, self.unit as u8]
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        let unit = match bytes[1] {
            1 => TtlUnit::Minute,
            2 => TtlUnit::Hour,
            3 => TtlUnit::Day,
            4 => TtlUnit::Week,
            5 => TtlUnit::Month,
            _ => TtlUnit::Empty,
        };
        if bytes[0] == 0 || unit == TtlUnit::Empty {
            return Ttl::NONE;
        }
        Ttl {
            count: bytes[0],
            unit,
        }
    }

    /// TTL expressed in minutes; 0 means no expiry.
    pub fn minutes(self) -> u32 {
        let per_unit = match self.unit {
            TtlUnit::Empty => 0,
            TtlUnit::Minute => 1,
            TtlUnit::Hour => 60,
            TtlUnit::Day => 60 * 24,
            TtlUnit::Week => 60 * 24 * 7,
            TtlUnit::Month => 60 * 24 * 30,
        };
        self.count as u32 * per_unit
    }
}

impl std::fmt::Display for Ttl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Ttl::NONE {
            return Ok(());
        }
        let unit = match self.unit {
            TtlUnit::Empty => "",
            TtlUnit::Minute => "m",
            TtlUnit::Hour => "h",
            TtlUnit::Day => "d",
            TtlUnit::Week => "w",
            TtlUnit::Month => "M",
        };
        write!(f, "{}{}", self.count, unit)
    }
}
