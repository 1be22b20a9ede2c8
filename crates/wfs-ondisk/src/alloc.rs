//! Free-blocks allocator header and extent nodes.
//!
//! The allocator of an area is a header block pointing at a singly linked
//! chain of extent nodes. Extents are area-relative and ascending across the
//! whole chain.

use serde::{Deserialize, Serialize};
use wfs_types::{ParseError, read_be_u16, read_be_u32, write_be_u16, write_be_u32};

use crate::{BlockKind, METADATA_BLOCK_SIZE, PAYLOAD_OFFSET, expect_kind, new_block};

const NODE_NEXT_OFFSET: usize = PAYLOAD_OFFSET;
const NODE_COUNT_OFFSET: usize = PAYLOAD_OFFSET + 4;
const NODE_EXTENTS_OFFSET: usize = PAYLOAD_OFFSET + 6;
const NODE_EXTENT_SIZE: usize = 8;

/// Most extents one node holds.
pub const MAX_NODE_EXTENTS: usize = (METADATA_BLOCK_SIZE - NODE_EXTENTS_OFFSET) / NODE_EXTENT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorHeader {
    pub free_blocks_count: u32,
    pub free_metadata_blocks_count: u32,
    /// Area-relative.
    pub free_metadata_block: u32,
    /// Area-relative first extent node, 0 when the area has no free extents.
    pub first_node: u32,
}

impl AllocatorHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        expect_kind(block, BlockKind::Allocator)?;
        Ok(Self {
            free_blocks_count: read_be_u32(block, PAYLOAD_OFFSET)?,
            free_metadata_blocks_count: read_be_u32(block, PAYLOAD_OFFSET + 4)?,
            free_metadata_block: read_be_u32(block, PAYLOAD_OFFSET + 8)?,
            first_node: read_be_u32(block, PAYLOAD_OFFSET + 12)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut block = new_block(BlockKind::Allocator)?;
        write_be_u32(&mut block, PAYLOAD_OFFSET, self.free_blocks_count)?;
        write_be_u32(&mut block, PAYLOAD_OFFSET + 4, self.free_metadata_blocks_count)?;
        write_be_u32(&mut block, PAYLOAD_OFFSET + 8, self.free_metadata_block)?;
        write_be_u32(&mut block, PAYLOAD_OFFSET + 12, self.first_node)?;
        Ok(block)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExtent {
    pub block: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentNode {
    /// Area-relative next node, 0 ends the chain.
    pub next: u32,
    pub extents: Vec<NodeExtent>,
}

impl ExtentNode {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        expect_kind(block, BlockKind::ExtentNode)?;
        let next = read_be_u32(block, NODE_NEXT_OFFSET)?;
        let count = usize::from(read_be_u16(block, NODE_COUNT_OFFSET)?);
        if count > MAX_NODE_EXTENTS {
            return Err(ParseError::InvalidField {
                field: "node_extent_count",
                reason: "exceeds node capacity",
            });
        }

        let mut extents: Vec<NodeExtent> = Vec::with_capacity(count);
        for index in 0..count {
            let offset = NODE_EXTENTS_OFFSET + index * NODE_EXTENT_SIZE;
            let extent = NodeExtent {
                block: read_be_u32(block, offset)?,
                count: read_be_u32(block, offset + 4)?,
            };
            if extent.count == 0 {
                return Err(ParseError::InvalidField {
                    field: "node_extent",
                    reason: "empty extent",
                });
            }
            if extents.last().is_some_and(|prev| prev.block >= extent.block) {
                return Err(ParseError::InvalidField {
                    field: "node_extent",
                    reason: "extents not ascending",
                });
            }
            extents.push(extent);
        }
        Ok(Self { next, extents })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let count = u16::try_from(self.extents.len())
            .ok()
            .filter(|count| usize::from(*count) <= MAX_NODE_EXTENTS)
            .ok_or(ParseError::InvalidField {
                field: "node_extent_count",
                reason: "exceeds node capacity",
            })?;
        let mut block = new_block(BlockKind::ExtentNode)?;
        write_be_u32(&mut block, NODE_NEXT_OFFSET, self.next)?;
        write_be_u16(&mut block, NODE_COUNT_OFFSET, count)?;
        for (index, extent) in self.extents.iter().enumerate() {
            let offset = NODE_EXTENTS_OFFSET + index * NODE_EXTENT_SIZE;
            write_be_u32(&mut block, offset, extent.block)?;
            write_be_u32(&mut block, offset + 4, extent.count)?;
        }
        Ok(block)
    }
}
