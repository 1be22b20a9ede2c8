#![forbid(unsafe_code)]
//! Block addressing primitives shared by every WFS crate.
//!
//! All on-disk integers are big-endian. Block numbers are device-absolute
//! unless a field is documented as area-relative; [`AreaGeometry`] converts
//! between the two.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// log2 of the device sector size.
pub const SECTOR_SIZE_LOG2: u32 = 9;
pub const SECTOR_SIZE: u32 = 1 << SECTOR_SIZE_LOG2;

/// log2 of a basic (metadata) block.
pub const BLOCK_SIZE_LOG2: u32 = 12;
pub const BLOCK_SIZE: u32 = 1 << BLOCK_SIZE_LOG2;

/// Sectors per basic block.
pub const SECTORS_PER_BLOCK: u32 = BLOCK_SIZE / SECTOR_SIZE;

/// Basic blocks spanned by one large data block (32 KiB).
pub const LARGE_BLOCK_BLOCKS: u32 = 8;
pub const LARGE_BLOCK_SIZE: u32 = BLOCK_SIZE * LARGE_BLOCK_BLOCKS;

/// Size of a SHA-1 block hash.
pub const HASH_SIZE: usize = 20;

/// The only on-disk format version this build understands.
pub const WFS_VERSION: u32 = 0x0101_0800;

/// Block holding the device header (and the root area header).
pub const DEVICE_HEADER_BLOCK: BlockNumber = BlockNumber(0);

/// Number of transaction areas on a device.
pub const TRANSACTION_AREAS: usize = 2;

pub type BlockHash = [u8; HASH_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockNumber(pub u32);

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this block on the underlying device.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) << BLOCK_SIZE_LOG2
    }

    /// Sector address of this block, used as the block's IV.
    ///
    /// Wraps on devices larger than 2^32 sectors; the IV is only a tweak.
    #[must_use]
    pub fn sector_address(self) -> u32 {
        self.0.wrapping_mul(SECTORS_PER_BLOCK)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Position and size of a quota area (or transaction area) on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AreaGeometry {
    /// First absolute block of the area.
    pub base: BlockNumber,
    pub blocks_count: u32,
}

impl AreaGeometry {
    #[must_use]
    pub fn new(base: BlockNumber, blocks_count: u32) -> Self {
        Self { base, blocks_count }
    }

    /// Translate an area-relative block number into a device-absolute one.
    ///
    /// Saturates instead of wrapping; callers bounds-check with
    /// [`AreaGeometry::contains`] before issuing I/O.
    #[must_use]
    pub fn to_absolute(self, relative: u32) -> BlockNumber {
        BlockNumber(self.base.0.saturating_add(relative))
    }

    /// Absolute end (exclusive) of the area.
    #[must_use]
    pub fn end(self) -> BlockNumber {
        self.to_absolute(self.blocks_count)
    }

    /// Whether `relative..relative + count` lies inside the area.
    #[must_use]
    pub fn contains(self, relative: u32, count: u32) -> bool {
        relative
            .checked_add(count)
            .is_some_and(|end| end <= self.blocks_count)
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
    #[error("invalid tag: expected {expected:#010x}, got {actual:#010x}")]
    InvalidTag { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
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
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let actual = data.len().saturating_sub(offset);
    offset
        .checked_add(len)
        .and_then(|end| data.get_mut(offset..end))
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn write_be_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

/// Number of basic blocks needed to hold `bytes`.
#[must_use]
pub fn blocks_for_bytes(bytes: u32) -> u32 {
    bytes.div_ceil(BLOCK_SIZE)
}

/// Round `bytes` up to a whole number of sectors.
#[must_use]
pub fn round_up_to_sector(bytes: u32) -> u32 {
    bytes.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}
