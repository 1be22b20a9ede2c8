//! File headers.
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x18 | 8 | file size in bytes |
//! | 0x20 | 2 | data extent count |
//! | 0x22 | 32 each | extents: block u32, size_in_blocks u32, data_size u32, SHA-1 |

use serde::{Deserialize, Serialize};
use wfs_types::{
    BlockHash, HASH_SIZE, ParseError, read_be_u16, read_be_u32, read_be_u64, read_fixed,
    write_be_u16, write_be_u32, write_be_u64, write_bytes,
};

use crate::{BlockKind, METADATA_BLOCK_SIZE, PAYLOAD_OFFSET, expect_kind, new_block};

const SIZE_OFFSET: usize = PAYLOAD_OFFSET;
const COUNT_OFFSET: usize = PAYLOAD_OFFSET + 8;
const EXTENTS_OFFSET: usize = PAYLOAD_OFFSET + 10;
const EXTENT_SIZE: usize = 12 + HASH_SIZE;

/// Most data extents one file header can describe.
pub const MAX_FILE_EXTENTS: usize = (METADATA_BLOCK_SIZE - EXTENTS_OFFSET) / EXTENT_SIZE;

/// One data block of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataExtent {
    /// Area-relative first block.
    pub block: u32,
    pub size_in_blocks: u32,
    /// Stored bytes; the last extent is padded past the end of the file.
    pub data_size: u32,
    pub hash: BlockHash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub size: u64,
    pub extents: Vec<DataExtent>,
}

impl FileHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        expect_kind(block, BlockKind::FileHeader)?;
        let size = read_be_u64(block, SIZE_OFFSET)?;
        let count = usize::from(read_be_u16(block, COUNT_OFFSET)?);
        if count > MAX_FILE_EXTENTS {
            return Err(ParseError::InvalidField {
                field: "extent_count",
                reason: "exceeds file header capacity",
            });
        }

        let mut extents = Vec::with_capacity(count);
        for index in 0..count {
            let offset = EXTENTS_OFFSET + index * EXTENT_SIZE;
            let extent = DataExtent {
                block: read_be_u32(block, offset)?,
                size_in_blocks: read_be_u32(block, offset + 4)?,
                data_size: read_be_u32(block, offset + 8)?,
                hash: read_fixed::<HASH_SIZE>(block, offset + 12)?,
            };
            if extent.size_in_blocks == 0 || extent.data_size == 0 {
                return Err(ParseError::InvalidField {
                    field: "extent",
                    reason: "empty data extent",
                });
            }
            extents.push(extent);
        }

        let header = Self { size, extents };
        if header.stored_bytes() < size {
            return Err(ParseError::InvalidField {
                field: "size",
                reason: "larger than stored data",
            });
        }
        Ok(header)
    }

    /// Total bytes held by the data extents.
    #[must_use]
    pub fn stored_bytes(&self) -> u64 {
        self.extents
            .iter()
            .map(|extent| u64::from(extent.data_size))
            .sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let count = u16::try_from(self.extents.len())
            .ok()
            .filter(|count| usize::from(*count) <= MAX_FILE_EXTENTS)
            .ok_or(ParseError::InvalidField {
                field: "extent_count",
                reason: "exceeds file header capacity",
            })?;

        let mut block = new_block(BlockKind::FileHeader)?;
        write_be_u64(&mut block, SIZE_OFFSET, self.size)?;
        write_be_u16(&mut block, COUNT_OFFSET, count)?;
        for (index, extent) in self.extents.iter().enumerate() {
            let offset = EXTENTS_OFFSET + index * EXTENT_SIZE;
            write_be_u32(&mut block, offset, extent.block)?;
            write_be_u32(&mut block, offset + 4, extent.size_in_blocks)?;
            write_be_u32(&mut block, offset + 8, extent.data_size)?;
            write_bytes(&mut block, offset + 12, &extent.hash)?;
        }
        Ok(block)
    }
}
