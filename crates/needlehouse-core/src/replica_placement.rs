//! Replica placement triples.
//!
//! Placement is written as three ASCII digits, e.g. `"110"`:
//! - first digit: copies on **different data centers**
//! - second digit: copies on **different racks** within the same data center
//! - third digit: copies on **different nodes** within the same rack
//!
//! `"000"` means a single copy. The total number of copies of a volume is
//! `1 + sum of the digits`. The triple also fits in one byte for the
//! superblock (`100*dc + 10*rack + node`).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaPlacement {
    /// Copies on other data centers
    pub diff_data_center_count: u8,
    /// Copies on other racks in the same data center
    pub diff_rack_count: u8,
    /// Copies on other nodes in the same rack
    pub same_rack_count: u8,
}

impl ReplicaPlacement {
    /// Parse from the three-digit form, e.g. `"001"`.
    pub fn parse(s: &str) -> Result<Self> {
        let digits: Vec<u8> = s
            .chars()
            .map(|c| c.to_digit(10).map(|d| d as u8))
            .collect::<Option<_>>()
            .ok_or_else(|| Error::InvalidReplicaPlacement(s.to_string()))?;
        if digits.len() != 3 {
            return Err(Error::InvalidReplicaPlacement(s.to_string()));
        }
        Ok(Self {
            diff_data_center_count: digits[0],
            diff_rack_count: digits[1],
            same_rack_count: digits[2],
        })
    }

    /// Single byte used in the superblock.
    pub fn to_byte(self) -> u8 {
        self.diff_data_center_count * 100 + self.diff_rack_count * 10 + self.same_rack_count
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            diff_data_center_count: b / 100,
            diff_rack_count: (b / 10) % 10,
            same_rack_count: b % 10,
        }
    }

    /// Total number of copies, including the primary.
    pub fn copy_count(self) -> usize {
        1 + (self.diff_data_center_count + self.diff_rack_count + self.same_rack_count) as usize
    }
}

impl std::fmt::Display for ReplicaPlacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.diff_data_center_count, self.diff_rack_count, self.same_rack_count
        )
    }
}
