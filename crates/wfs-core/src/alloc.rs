//! Free-blocks allocators and free-extent coalescing.

use std::collections::BTreeSet;
use std::vec;

use serde::{Deserialize, Serialize};
use wfs_error::{Result, WfsError};
use wfs_ondisk::{AllocatorHeader, ExtentNode, NodeExtent};
use wfs_types::{AreaGeometry, BlockNumber};

use crate::area::Area;
use crate::parse_to_wfs_error;

/// A run of free blocks, area-relative, as stored by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeExtent {
    pub block_number: u32,
    pub blocks_count: u32,
}

/// A maximal run of free blocks in absolute addressing, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeRange {
    pub start: BlockNumber,
    pub end: BlockNumber,
}

impl std::fmt::Display for FreeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[0x{:08x}-0x{:08x}]", self.start.0, self.end.0)
    }
}

#[derive(Debug, Clone)]
pub struct FreeBlocksAllocator<'d> {
    area: Area<'d>,
    header: AllocatorHeader,
}

impl<'d> FreeBlocksAllocator<'d> {
    pub(crate) fn new(area: Area<'d>, header: AllocatorHeader) -> Self {
        Self { area, header }
    }

    #[must_use]
    pub fn header(&self) -> &AllocatorHeader {
        &self.header
    }

    #[must_use]
    pub fn free_blocks_count(&self) -> u32 {
        self.header.free_blocks_count
    }

    #[must_use]
    pub fn free_metadata_blocks_count(&self) -> u32 {
        self.header.free_metadata_blocks_count
    }

    /// Absolute address of the free metadata block.
    #[must_use]
    pub fn free_metadata_block(&self) -> BlockNumber {
        self.area.to_absolute(self.header.free_metadata_block)
    }

    #[must_use]
    pub fn area(&self) -> &Area<'d> {
        &self.area
    }

    /// Iterate the extent nodes in chain order without looking at the
    /// extents they hold.
    #[must_use]
    pub fn nodes(&self) -> ExtentNodes<'d> {
        ExtentNodes {
            area: self.area.clone(),
            next_node: self.header.first_node,
            visited: BTreeSet::new(),
        }
    }

    /// Iterate the free extents in ascending order, reading extent nodes as
    /// they are reached.
    #[must_use]
    pub fn extents(&self) -> FreeExtents<'d> {
        FreeExtents {
            nodes: self.nodes(),
            current: Vec::new().into_iter(),
            last_end: None,
            failed: false,
        }
    }
}

/// Lazy iterator over the extent node chain of an allocator.
///
/// Yields each node with its absolute address. Ends after yielding an
/// unreadable node or a chain loop.
#[derive(Debug)]
pub struct ExtentNodes<'d> {
    area: Area<'d>,
    next_node: u32,
    visited: BTreeSet<u32>,
}

impl Iterator for ExtentNodes<'_> {
    type Item = Result<(BlockNumber, ExtentNode)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_node == 0 {
            return None;
        }
        let relative = std::mem::take(&mut self.next_node);
        if !self.visited.insert(relative) {
            return Some(Err(WfsError::Corruption {
                block: self.area.to_absolute(relative).0,
                detail: "extent node chain loops".to_owned(),
            }));
        }
        let loaded = self.area.read_metadata(relative).and_then(|(block, buf)| {
            let node =
                ExtentNode::parse(buf.as_slice()).map_err(|e| parse_to_wfs_error(block, &e))?;
            Ok((block, node))
        });
        if let Ok((_, node)) = &loaded {
            self.next_node = node.next;
        }
        Some(loaded)
    }
}

/// Lazy iterator over an allocator's free extents.
///
/// Yields an error and stops on an unreadable node, a node chain loop, an
/// extent outside the area, or extents out of ascending order.
#[derive(Debug)]
pub struct FreeExtents<'d> {
    nodes: ExtentNodes<'d>,
    current: vec::IntoIter<NodeExtent>,
    last_end: Option<u32>,
    failed: bool,
}

impl FreeExtents<'_> {
    fn check(&mut self, extent: NodeExtent) -> Result<FreeExtent> {
        let area = &self.nodes.area;
        let block = area.to_absolute(extent.block).0;
        if !area.geometry().contains(extent.block, extent.count) {
            return Err(WfsError::Corruption {
                block,
                detail: format!("free extent of {:#x} blocks leaves its area", extent.count),
            });
        }
        if self.last_end.is_some_and(|end| extent.block < end) {
            return Err(WfsError::Corruption {
                block,
                detail: "free extents overlap or are out of order".to_owned(),
            });
        }
        self.last_end = Some(extent.block + extent.count);
        Ok(FreeExtent {
            block_number: extent.block,
            blocks_count: extent.count,
        })
    }
}

impl Iterator for FreeExtents<'_> {
    type Item = Result<FreeExtent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(extent) = self.current.next() {
                let checked = self.check(extent);
                self.failed = checked.is_err();
                return Some(checked);
            }
            match self.nodes.next()? {
                Ok((_, node)) => self.current = node.extents.into_iter(),
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Incremental merge of ascending free extents into absolute free ranges.
///
/// An extent joins the open range only when it starts exactly where the
/// range ends; input order is trusted, never re-sorted.
#[derive(Debug, Clone)]
pub struct FreeRangeCoalescer {
    geometry: AreaGeometry,
    open: Option<FreeExtent>,
}

impl FreeRangeCoalescer {
    #[must_use]
    pub fn new(geometry: AreaGeometry) -> Self {
        Self {
            geometry,
            open: None,
        }
    }

    /// Feed the next extent. Returns the range it closed, if any.
    pub fn push(&mut self, extent: FreeExtent) -> Option<FreeRange> {
        if let Some(open) = self.open.as_mut() {
            if open.block_number.checked_add(open.blocks_count) == Some(extent.block_number) {
                open.blocks_count = open.blocks_count.saturating_add(extent.blocks_count);
                return None;
            }
        }
        let closed = self.open.replace(extent)?;
        Some(self.to_range(closed))
    }

    /// Close the last open range.
    #[must_use]
    pub fn finish(self) -> Option<FreeRange> {
        self.open.map(|open| self.to_range(open))
    }

    fn to_range(&self, extent: FreeExtent) -> FreeRange {
        FreeRange {
            start: self.geometry.to_absolute(extent.block_number),
            end: self
                .geometry
                .to_absolute(extent.block_number.saturating_add(extent.blocks_count)),
        }
    }
}

/// Coalesce a complete extent sequence of the area described by `geometry`.
pub fn coalesce_free_extents<I>(geometry: AreaGeometry, extents: I) -> Vec<FreeRange>
where
    I: IntoIterator<Item = FreeExtent>,
{
    let mut coalescer = FreeRangeCoalescer::new(geometry);
    let mut ranges: Vec<FreeRange> = extents
        .into_iter()
        .filter_map(|extent| coalescer.push(extent))
        .collect();
    ranges.extend(coalescer.finish());
    ranges
}
