#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Magic bytes identifying a mossfs superblock record.
pub const DISK_MAGIC: [u8; 8] = *b"mossfs01";

/// On-disk format version, `major << 16 | minor`.
///
/// A mount succeeds only when the on-disk major version equals ours and the
/// on-disk minor version is not newer than ours.
pub const DISK_VERSION: u32 = 0x0001_0000;

/// Maximum length in bytes of a single path segment.
pub const NAME_MAX: usize = 255;

/// On-disk sentinel meaning "no block".
pub const NO_BLOCK: u32 = 0xFFFF_FFFF;

/// Major component of an on-disk version word.
#[must_use]
pub fn version_major(version: u32) -> u16 {
    (version >> 16) as u16
}

/// Minor component of an on-disk version word.
#[must_use]
pub fn version_minor(version: u32) -> u16 {
    (version & 0xFFFF) as u16
}

/// Index into the block address space of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockPointer(pub u32);

impl BlockPointer {
    /// Decode an on-disk pointer word, mapping the sentinel to `None`.
    #[must_use]
    pub fn decode(raw: u32) -> Option<Self> {
        (raw != NO_BLOCK).then_some(Self(raw))
    }

    /// Encode an optional pointer into its on-disk word.
    #[must_use]
    pub fn encode(ptr: Option<Self>) -> u32 {
        ptr.map_or(NO_BLOCK, |p| p.0)
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated block device geometry.
///
/// Invariants, enforced at construction:
/// - every field is positive
/// - `block_size` is a multiple of both `read_size` and `prog_size`
/// - `block_size >= 128` (the chain index arithmetic needs pointer overhead
///   to stay small relative to the block)
/// - `block_count >= 4` (superblock pair plus root pair)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    read_size: u32,
    prog_size: u32,
    block_size: u32,
    block_count: u32,
    lookahead_size: u32,
}

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: u32 = 128;

/// Smallest supported block count (superblock pair plus root pair).
pub const MIN_BLOCK_COUNT: u32 = 4;

impl Geometry {
    pub fn new(
        read_size: u32,
        prog_size: u32,
        block_size: u32,
        block_count: u32,
        lookahead_size: u32,
    ) -> Result<Self, ParseError> {
        if read_size == 0 {
            return Err(ParseError::InvalidField {
                field: "read_size",
                reason: "must be positive",
            });
        }
        if prog_size == 0 {
            return Err(ParseError::InvalidField {
                field: "prog_size",
                reason: "must be positive",
            });
        }
        if block_size < MIN_BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be at least 128",
            });
        }
        if block_size % read_size != 0 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a multiple of read_size",
            });
        }
        if block_size % prog_size != 0 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a multiple of prog_size",
            });
        }
        if block_count < MIN_BLOCK_COUNT {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "must be at least 4",
            });
        }
        if lookahead_size == 0 {
            return Err(ParseError::InvalidField {
                field: "lookahead_size",
                reason: "must be positive",
            });
        }
        Ok(Self {
            read_size,
            prog_size,
            block_size,
            block_count,
            lookahead_size,
        })
    }

    #[must_use]
    pub fn read_size(&self) -> u32 {
        self.read_size
    }

    #[must_use]
    pub fn prog_size(&self) -> u32 {
        self.prog_size
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Lookahead bitmap size in bytes; the window covers eight blocks per byte.
    #[must_use]
    pub fn lookahead_size(&self) -> u32 {
        self.lookahead_size
    }

    #[must_use]
    pub fn block_size_usize(&self) -> usize {
        self.block_size as usize
    }

    /// Total device capacity in bytes.
    #[must_use]
    pub fn device_bytes(&self) -> u64 {
        u64::from(self.block_size) * u64::from(self.block_count)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("unknown record tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be positive; alignments here are device units
/// (`read_size`, `prog_size`), which are not required to be powers of two.
#[must_use]
pub fn align_down(value: u32, alignment: u32) -> u32 {
    value - value % alignment
}

/// Round `value` up to the nearest multiple of `alignment`.
#[must_use]
pub fn align_up(value: u32, alignment: u32) -> u32 {
    match value % alignment {
        0 => value,
        rem => value + (alignment - rem),
    }
}
