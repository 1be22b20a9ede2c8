#![forbid(unsafe_code)]
//! On-disk format codecs for WFS metadata blocks.
//!
//! Pure parsing crate with no I/O. Every metadata block is one basic block
//! (4 KiB) that starts with a common header:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00 | 20 | SHA-1 of bytes `0x14..` (sealed by the block layer) |
//! | 0x14 | 4 | block kind tag |
//!
//! Block references inside metadata are area-relative. Encoders produce a
//! full block with a zeroed hash; the block layer seals it on write.

pub mod alloc;
pub mod device;
pub mod directory;
pub mod file;

pub use alloc::{AllocatorHeader, ExtentNode, NodeExtent};
pub use device::{AreaHeader, DeviceHeader, TransactionAreaHeader, peek_version};
pub use directory::{DirectoryBlock, DirectoryEntry, EntryKind};
pub use file::{DataExtent, FileHeader};

use serde::{Deserialize, Serialize};
use wfs_types::{BLOCK_SIZE, HASH_SIZE, ParseError, read_be_u32, write_be_u32};

const TAG_OFFSET: usize = HASH_SIZE;

/// First byte after the common header.
pub const PAYLOAD_OFFSET: usize = TAG_OFFSET + 4;

/// Size of every metadata block.
pub const METADATA_BLOCK_SIZE: usize = BLOCK_SIZE as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    DeviceHeader,
    AreaHeader,
    Directory,
    FileHeader,
    Allocator,
    ExtentNode,
    TransactionArea,
}

impl BlockKind {
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            Self::DeviceHeader => 0x5746_5344,
            Self::AreaHeader => 0x5746_5341,
            Self::Directory => 0x5746_5364,
            Self::FileHeader => 0x5746_5366,
            Self::Allocator => 0x5746_5362,
            Self::ExtentNode => 0x5746_536E,
            Self::TransactionArea => 0x5746_5374,
        }
    }

    #[must_use]
    pub fn from_tag(tag: u32) -> Option<Self> {
        [
            Self::DeviceHeader,
            Self::AreaHeader,
            Self::Directory,
            Self::FileHeader,
            Self::Allocator,
            Self::ExtentNode,
            Self::TransactionArea,
        ]
        .into_iter()
        .find(|kind| kind.tag() == tag)
    }
}

/// Read the kind tag of a metadata block.
pub fn block_kind(block: &[u8]) -> Result<BlockKind, ParseError> {
    let tag = read_be_u32(block, TAG_OFFSET)?;
    BlockKind::from_tag(tag).ok_or(ParseError::InvalidField {
        field: "tag",
        reason: "unknown block kind",
    })
}

pub(crate) fn expect_kind(block: &[u8], kind: BlockKind) -> Result<(), ParseError> {
    if block.len() != METADATA_BLOCK_SIZE {
        return Err(ParseError::InsufficientData {
            needed: METADATA_BLOCK_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }
    let actual = read_be_u32(block, TAG_OFFSET)?;
    if actual != kind.tag() {
        return Err(ParseError::InvalidTag {
            expected: kind.tag(),
            actual,
        });
    }
    Ok(())
}

pub(crate) fn new_block(kind: BlockKind) -> Result<Vec<u8>, ParseError> {
    let mut block = vec![0_u8; METADATA_BLOCK_SIZE];
    write_be_u32(&mut block, TAG_OFFSET, kind.tag())?;
    Ok(block)
}
