//! Quota areas and address translation.

use tracing::trace;
use wfs_block::{BlockBuf, BlockParams, BlocksDevice, HashCheck};
use wfs_error::{Result, WfsError};
use wfs_ondisk::{AllocatorHeader, AreaHeader, DataExtent};
use wfs_types::{AreaGeometry, BlockNumber};

use crate::alloc::FreeBlocksAllocator;
use crate::directory::Directory;
use crate::parse_to_wfs_error;

/// A quota area: a contiguous block range with its own allocator, root
/// directory and shadow directories.
#[derive(Clone)]
pub struct Area<'d> {
    dev: &'d dyn BlocksDevice,
    geometry: AreaGeometry,
    header: AreaHeader,
}

impl std::fmt::Debug for Area<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Area")
            .field("geometry", &self.geometry)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl<'d> Area<'d> {
    pub(crate) fn new(dev: &'d dyn BlocksDevice, geometry: AreaGeometry, header: AreaHeader) -> Self {
        Self {
            dev,
            geometry,
            header,
        }
    }

    #[must_use]
    pub fn geometry(&self) -> AreaGeometry {
        self.geometry
    }

    #[must_use]
    pub fn header(&self) -> &AreaHeader {
        &self.header
    }

    #[must_use]
    pub fn to_absolute(&self, relative: u32) -> BlockNumber {
        self.geometry.to_absolute(relative)
    }

    fn check_range(&self, relative: u32, count: u32) -> Result<BlockNumber> {
        if !self.geometry.contains(relative, count) {
            return Err(WfsError::OutOfRange {
                block: self.to_absolute(relative).0,
                blocks_count: self.geometry.end().0,
            });
        }
        Ok(self.to_absolute(relative))
    }

    /// Read one hash-checked metadata block at an area-relative address.
    pub fn read_metadata(&self, relative: u32) -> Result<(BlockNumber, BlockBuf)> {
        let block = self.check_range(relative, 1)?;
        trace!(%block, "read metadata");
        let buf = self
            .dev
            .read_block(block, &BlockParams::metadata(block), HashCheck::Embedded)?;
        Ok((block, buf))
    }

    /// Read a file data block, verified against the hash its file stores.
    pub fn read_data(&self, extent: &DataExtent) -> Result<BlockBuf> {
        let block = self.check_range(extent.block, extent.size_in_blocks)?;
        let params = BlockParams::data(block, extent.size_in_blocks, extent.data_size);
        self.dev
            .read_block(block, &params, HashCheck::Expected(&extent.hash))
    }

    /// Open the sub-area whose header sits at `relative`.
    pub(crate) fn open_sub_area(&self, relative: u32) -> Result<Area<'d>> {
        let (block, buf) = self.read_metadata(relative)?;
        let header = AreaHeader::parse(buf.as_slice()).map_err(|e| parse_to_wfs_error(block, &e))?;
        // Relative block 0 of the parent is its own header.
        if relative == 0 || !self.geometry.contains(relative, header.blocks_count) {
            return Err(WfsError::Corruption {
                block: block.0,
                detail: format!(
                    "sub-area of {:#x} blocks does not fit its parent [{}-{}]",
                    header.blocks_count,
                    self.geometry.base,
                    self.geometry.end()
                ),
            });
        }
        Ok(Area::new(
            self.dev,
            AreaGeometry::new(block, header.blocks_count),
            header,
        ))
    }

    /// The area's root directory, which is its quota boundary.
    pub fn root_directory(&self) -> Result<Directory<'d>> {
        Directory::open(self.clone(), self.header.root_directory, true)
    }

    pub fn free_blocks_allocator(&self) -> Result<FreeBlocksAllocator<'d>> {
        let (block, buf) = self.read_metadata(self.header.allocator)?;
        let header =
            AllocatorHeader::parse(buf.as_slice()).map_err(|e| parse_to_wfs_error(block, &e))?;
        Ok(FreeBlocksAllocator::new(self.clone(), header))
    }
}

/// Quota capabilities of a directory that owns an area.
#[derive(Debug, Clone)]
pub struct Quota<'d> {
    area: Area<'d>,
}

impl<'d> Quota<'d> {
    pub(crate) fn new(area: Area<'d>) -> Self {
        Self { area }
    }

    #[must_use]
    pub fn area(&self) -> &Area<'d> {
        &self.area
    }

    pub fn free_blocks_allocator(&self) -> Result<FreeBlocksAllocator<'d>> {
        self.area.free_blocks_allocator()
    }

    pub fn shadow_directory_1(&self) -> Result<Directory<'d>> {
        Directory::open(self.area.clone(), self.area.header.shadow_directory_1, false)
    }

    pub fn shadow_directory_2(&self) -> Result<Directory<'d>> {
        Directory::open(self.area.clone(), self.area.header.shadow_directory_2, false)
    }
}
