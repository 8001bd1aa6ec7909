//! Needle Data Structure and On-Disk Codec
//!
//! This module defines the core `Needle` type - the fundamental unit of data
//! in NeedleHouse - and its version-3 binary record format.
//!
//! ## What is a Needle?
//! A needle is a single immutable stored object inside a volume, similar to:
//! - One photo in a photo store
//! - One attachment blob in a mail system
//! - One chunk of a large file (chunk manifests tie them together)
//!
//! ## Structure
//! Each needle contains:
//! - **id**: 64-bit identifier, unique within its volume
//! - **cookie**: 32-bit random tag; a reader must present it, which makes
//!   needle addresses unguessable
//! - **data**: the payload (arbitrary bytes)
//! - optional metadata: name, MIME type, last-modified timestamp, TTL
//!
//! ## On-Disk Record Format (version 3)
//!
//! ```text
//! ┌─────────┬───────────┬───────────┬──────────┬────────┬──────────────┬────────┬─────────┐
//! │ Cookie  │ NeedleId  │ DataSize  │ Data     │ Flags  │ Meta fields  │ CRC32  │ Padding │
//! │ (4 B)   │ (8 B)     │ (4 B)     │ (N B)    │ (1 B)  │ (variable)   │ (4 B)  │ (0-7 B) │
//! └─────────┴───────────┴───────────┴──────────┴────────┴──────────────┴────────┴─────────┘
//! ```
//!
//! Meta fields appear in a fixed order, each present only when its flag bit
//! is set: name (1-byte length + bytes), mime (1-byte length + bytes),
//! last-modified (5 bytes, seconds), TTL (2 bytes). Every record is padded
//! with zeros to a multiple of [`NEEDLE_PADDING`] so index offsets fit in a
//! `u32` measured in 8-byte units.
//!
//! ## Design Decisions
//! - Uses `bytes::Bytes` for the payload so reads can slice without copying
//! - The CRC covers the payload only; header corruption is caught by size
//!   and cookie validation instead
//! - A zero-size record is a tombstone: appended by `delete`, never served
//!
//! ## Example
//! ```
//! use needlehouse_core::Needle;
//! use bytes::Bytes;
//!
//! let needle = Needle::new(42, 0x637037d6, Bytes::from("hello world"));
//! let encoded = needle.encode().unwrap();
//! assert_eq!(encoded.len() % 8, 0);
//! let decoded = Needle::decode(&encoded, 3).unwrap();
//! assert_eq!(decoded, needle);
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::ttl::Ttl;

/// 64-bit needle identifier, unique within one volume.
pub type NeedleId = u64;

/// 32-bit volume identifier.
pub type VolumeId = u32;

/// Current on-disk format version.
pub const CURRENT_VERSION: u8 = 3;

/// Every record in a `.dat` file starts at a multiple of this.
pub const NEEDLE_PADDING: u32 = 8;

/// Cookie (4) + id (8) + data size (4).
pub const NEEDLE_HEADER_SIZE: u32 = 16;

/// CRC32 trailer length.
pub const NEEDLE_CHECKSUM_SIZE: u32 = 4;

/// Last-modified timestamps are stored in 5 bytes (seconds since epoch).
const LAST_MODIFIED_BYTES: usize = 5;

/// Payload is gzip-compressed.
pub const FLAG_GZIP: u8 = 0x01;
/// Record carries a name field.
pub const FLAG_HAS_NAME: u8 = 0x02;
/// Record carries a MIME type field.
pub const FLAG_HAS_MIME: u8 = 0x04;
/// Record carries a last-modified timestamp.
pub const FLAG_HAS_LAST_MODIFIED: u8 = 0x08;
/// Record carries a TTL.
pub const FLAG_HAS_TTL: u8 = 0x10;
/// Payload is a chunk manifest describing a large, split object.
pub const FLAG_IS_CHUNK_MANIFEST: u8 = 0x80;

/// A single stored object inside a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Needle {
    /// Needle id, unique within the volume
    pub id: NeedleId,

    /// Random tag required on reads
    pub cookie: u32,

    /// Payload
    pub data: Bytes,

    /// Optional file name
    pub name: Option<Bytes>,

    /// Optional MIME type
    pub mime: Option<Bytes>,

    /// Last-modified time, seconds since epoch (low 40 bits are stored)
    pub last_modified: u64,

    /// Time-to-live
    pub ttl: Ttl,

    /// Flag bits (FLAG_* constants)
    pub flags: u8,
}

impl Needle {
    /// Create a plain needle with no metadata.
    pub fn new(id: NeedleId, cookie: u32, data: Bytes) -> Self {
        Self {
            id,
            cookie,
            data,
            name: None,
            mime: None,
            last_modified: 0,
            ttl: Ttl::NONE,
            flags: 0,
        }
    }

    /// Create the zero-size record appended by a delete.
    pub fn tombstone(id: NeedleId, cookie: u32) -> Self {
        Self::new(id, cookie, Bytes::new())
    }

    /// Attach a name (sets the flag bit).
    pub fn with_name(mut self, name: Bytes) -> Self {
        self.flags |= FLAG_HAS_NAME;
        self.name = Some(name);
        self
    }

    /// Attach a MIME type (sets the flag bit).
    pub fn with_mime(mut self, mime: Bytes) -> Self {
        self.flags |= FLAG_HAS_MIME;
        self.mime = Some(mime);
        self
    }

    /// Attach a last-modified timestamp in seconds (sets the flag bit).
    pub fn with_last_modified(mut self, seconds: u64) -> Self {
        self.flags |= FLAG_HAS_LAST_MODIFIED;
        self.last_modified = seconds & 0xFF_FFFF_FFFF;
        self
    }

    /// Attach a TTL (sets the flag bit).
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        if ttl != Ttl::NONE {
            self.flags |= FLAG_HAS_TTL;
            self.ttl = ttl;
        }
        self
    }

    pub fn is_gzipped(&self) -> bool {
        self.flags & FLAG_GZIP != 0
    }

    pub fn is_chunk_manifest(&self) -> bool {
        self.flags & FLAG_IS_CHUNK_MANIFEST != 0
    }

    /// A zero-size record marks a logical delete.
    pub fn is_tombstone(&self) -> bool {
        self.data.is_empty()
    }

    /// Unpadded length of the encoded record.
    pub fn encoded_len(&self) -> u32 {
        let mut len = NEEDLE_HEADER_SIZE + self.data.len() as u32 + 1;
        if self.flags & FLAG_HAS_NAME != 0 {
            len += 1 + self.name.as_ref().map(|n| n.len() as u32).unwrap_or(0);
        }
        if self.flags & FLAG_HAS_MIME != 0 {
            len += 1 + self.mime.as_ref().map(|m| m.len() as u32).unwrap_or(0);
        }
        if self.flags & FLAG_HAS_LAST_MODIFIED != 0 {
            len += LAST_MODIFIED_BYTES as u32;
        }
        if self.flags & FLAG_HAS_TTL != 0 {
            len += 2;
        }
        len + NEEDLE_CHECKSUM_SIZE
    }

    /// Padded on-disk footprint of the encoded record.
    pub fn disk_size(&self) -> u32 {
        padded_size(self.encoded_len())
    }

    /// Serialize to the version-3 record format, padded to 8 bytes.
    pub fn encode(&self) -> Result<Bytes> {
        if let Some(name) = &self.name {
            if name.len() > u8::MAX as usize {
                return Err(Error::Internal("needle name longer than 255 bytes".into()));
            }
        }
        if let Some(mime) = &self.mime {
            if mime.len() > u8::MAX as usize {
                return Err(Error::Internal("needle mime longer than 255 bytes".into()));
            }
        }

        let unpadded = self.encoded_len();
        let mut buf = BytesMut::with_capacity(padded_size(unpadded) as usize);
        buf.put_u32(self.cookie);
        buf.put_u64(self.id);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.put_u8(self.flags);
        if self.flags & FLAG_HAS_NAME != 0 {
            let name = self.name.as_deref().unwrap_or(&[]);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name);
        }
        if self.flags & FLAG_HAS_MIME != 0 {
            let mime = self.mime.as_deref().unwrap_or(&[]);
            buf.put_u8(mime.len() as u8);
            buf.put_slice(mime);
        }
        if self.flags & FLAG_HAS_LAST_MODIFIED != 0 {
            buf.put_slice(&self.last_modified.to_be_bytes()[8 - LAST_MODIFIED_BYTES..]);
        }
        if self.flags & FLAG_HAS_TTL != 0 {
            buf.put_slice(&self.ttl.to_bytes());
        }
        buf.put_u32(crc32fast::hash(&self.data));
        buf.resize(padded_size(unpadded) as usize, 0);
        Ok(buf.freeze())
    }

    /// Decode a record from `bytes`, which may include trailing padding.
    ///
    /// Verifies the CRC and every declared length against the slice. A
    /// failure means the bytes at this offset are not a valid record, which
    /// callers scanning a `.dat` file treat as a recoverable end-of-stream.
    pub fn decode(bytes: &[u8], version: u8) -> Result<Self> {
        if version != CURRENT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let mut buf = bytes;
        if buf.remaining() < NEEDLE_HEADER_SIZE as usize {
            return Err(Error::Corrupt("record shorter than header".into()));
        }
        let cookie = buf.get_u32();
        let id = buf.get_u64();
        let data_size = buf.get_u32() as usize;
        if buf.remaining() < data_size + 1 + NEEDLE_CHECKSUM_SIZE as usize {
            return Err(Error::Corrupt(format!(
                "declared data size {} exceeds record bounds",
                data_size
            )));
        }
        let data = Bytes::copy_from_slice(&buf[..data_size]);
        buf.advance(data_size);
        let flags = buf.get_u8();

        let mut name = None;
        if flags & FLAG_HAS_NAME != 0 {
            name = Some(read_len_prefixed(&mut buf)?);
        }
        let mut mime = None;
        if flags & FLAG_HAS_MIME != 0 {
            mime = Some(read_len_prefixed(&mut buf)?);
        }
        let mut last_modified = 0u64;
        if flags & FLAG_HAS_LAST_MODIFIED != 0 {
            if buf.remaining() < LAST_MODIFIED_BYTES {
                return Err(Error::Corrupt("truncated last-modified field".into()));
            }
            for _ in 0..LAST_MODIFIED_BYTES {
                last_modified = (last_modified << 8) | buf.get_u8() as u64;
            }
        }
        let mut ttl = Ttl::NONE;
        if flags & FLAG_HAS_TTL != 0 {
            if buf.remaining() < 2 {
                return Err(Error::Corrupt("truncated ttl field".into()));
            }
            ttl = Ttl::from_bytes([buf.get_u8(), buf.get_u8()]);
        }
        if buf.remaining() < NEEDLE_CHECKSUM_SIZE as usize {
            return Err(Error::Corrupt("missing checksum trailer".into()));
        }
        let checksum = buf.get_u32();
        if checksum != crc32fast::hash(&data) {
            return Err(Error::CrcMismatch);
        }

        Ok(Self {
            id,
            cookie,
            data,
            name,
            mime,
            last_modified,
            ttl,
            flags,
        })
    }
}

/// Round `len` up to the next multiple of [`NEEDLE_PADDING`].
pub fn padded_size(len: u32) -> u32 {
    len.div_ceil(NEEDLE_PADDING) * NEEDLE_PADDING
}

fn read_len_prefixed(buf: &mut &[u8]) -> Result<Bytes> {
    if buf.remaining() < 1 {
        return Err(Error::Corrupt("truncated length prefix".into()));
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(Error::Corrupt("truncated length-prefixed field".into()));
    }
    let out = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(out)
}
