#![forbid(unsafe_code)]
//! A mounted WFS filesystem on top of a [`BlocksDevice`].
//!
//! Nothing here caches blocks: every handle reads the metadata it needs
//! exactly once, when it is created, and iterators read further blocks
//! lazily. Traversals that must observe each block once (discovery) rely on
//! that.

pub mod alloc;
pub mod area;
pub mod directory;
pub mod file;
pub mod inspect;
pub mod transactions;

pub use alloc::{
    ExtentNodes, FreeBlocksAllocator, FreeExtent, FreeExtents, FreeRange, FreeRangeCoalescer,
    coalesce_free_extents,
};
pub use area::{Area, Quota};
pub use directory::{Directory, Entries, Entry, child_path};
pub use file::{File, FileReader};
pub use inspect::{AllocatorDump, AreaReport, BlockSpan, InspectFailure, dump_allocators};
pub use transactions::TransactionsArea;

use tracing::{debug, info};
use wfs_block::{BlockParams, BlocksDevice, HashCheck};
use wfs_crypto::verify_embedded_hash;
use wfs_error::{Result, WfsError};
use wfs_ondisk::{DeviceHeader, peek_version};
use wfs_types::{
    AreaGeometry, BlockNumber, DEVICE_HEADER_BLOCK, ParseError, TRANSACTION_AREAS, WFS_VERSION,
};

/// Map a metadata decoding failure to the block it came from.
pub(crate) fn parse_to_wfs_error(block: BlockNumber, err: &ParseError) -> WfsError {
    WfsError::Corruption {
        block: block.0,
        detail: err.to_string(),
    }
}

/// Probe a device for a WFS header.
///
/// Block 0 is read without hash verification so that a wrong key surfaces
/// as [`WfsError::InvalidWfsVersion`] rather than as a hash failure. Only
/// after the version matches is the embedded hash checked and the header
/// decoded.
pub fn detect_device(dev: &dyn BlocksDevice) -> Result<DeviceHeader> {
    let params = BlockParams::metadata(DEVICE_HEADER_BLOCK);
    let block = dev.read_block(DEVICE_HEADER_BLOCK, &params, HashCheck::Skip)?;
    let version =
        peek_version(block.as_slice()).map_err(|e| parse_to_wfs_error(DEVICE_HEADER_BLOCK, &e))?;
    if version != WFS_VERSION {
        debug!(version = format_args!("{version:#010x}"), "device header version mismatch");
        return Err(WfsError::InvalidWfsVersion {
            expected: WFS_VERSION,
            actual: version,
        });
    }
    if !verify_embedded_hash(block.as_slice()) {
        return Err(WfsError::HashMismatch {
            block: DEVICE_HEADER_BLOCK.0,
        });
    }
    let header = DeviceHeader::parse(block.as_slice())
        .map_err(|e| parse_to_wfs_error(DEVICE_HEADER_BLOCK, &e))?;
    check_device_size(dev, &header)?;
    Ok(header)
}

fn check_device_size(dev: &dyn BlocksDevice, header: &DeviceHeader) -> Result<()> {
    if header.blocks_count > dev.blocks_count() {
        return Err(WfsError::Corruption {
            block: DEVICE_HEADER_BLOCK.0,
            detail: format!(
                "header claims {:#x} blocks but the device holds {:#x}",
                header.blocks_count,
                dev.blocks_count()
            ),
        });
    }
    Ok(())
}

/// An opened WFS device.
pub struct WfsDevice<'d> {
    dev: &'d dyn BlocksDevice,
    header: DeviceHeader,
}

impl std::fmt::Debug for WfsDevice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WfsDevice")
            .field("header", &self.header)
            .field("device_blocks", &self.dev.blocks_count())
            .finish()
    }
}

impl<'d> WfsDevice<'d> {
    /// Read and validate the device header (block 0, hash-checked).
    pub fn open(dev: &'d dyn BlocksDevice) -> Result<Self> {
        let params = BlockParams::metadata(DEVICE_HEADER_BLOCK);
        let block = dev.read_block(DEVICE_HEADER_BLOCK, &params, HashCheck::Embedded)?;
        let version = peek_version(block.as_slice())
            .map_err(|e| parse_to_wfs_error(DEVICE_HEADER_BLOCK, &e))?;
        if version != WFS_VERSION {
            return Err(WfsError::InvalidWfsVersion {
                expected: WFS_VERSION,
                actual: version,
            });
        }
        let header = DeviceHeader::parse(block.as_slice())
            .map_err(|e| parse_to_wfs_error(DEVICE_HEADER_BLOCK, &e))?;
        check_device_size(dev, &header)?;
        info!(
            blocks_count = header.blocks_count,
            root_area_blocks = header.root_area.blocks_count,
            "opened WFS device"
        );
        Ok(Self { dev, header })
    }

    #[must_use]
    pub fn header(&self) -> &DeviceHeader {
        &self.header
    }

    #[must_use]
    pub fn blocks_device(&self) -> &'d dyn BlocksDevice {
        self.dev
    }

    /// The root area. Its header lives in block 0, which is already loaded.
    #[must_use]
    pub fn root_area(&self) -> Area<'d> {
        Area::new(
            self.dev,
            AreaGeometry::new(DEVICE_HEADER_BLOCK, self.header.root_area.blocks_count),
            self.header.root_area,
        )
    }

    /// The root directory, which is also the root area's quota directory.
    pub fn root_directory(&self) -> Result<Directory<'d>> {
        self.root_area().root_directory()
    }

    /// Open transaction area `index` (0 or 1), reading its header block.
    pub fn transactions_area(&self, index: usize) -> Result<TransactionsArea> {
        let geometry = self
            .header
            .transactions
            .get(index)
            .copied()
            .ok_or_else(|| {
                WfsError::NotFound(format!(
                    "transactions area {index} (device has {TRANSACTION_AREAS})"
                ))
            })?;
        TransactionsArea::open(self.dev, index, geometry)
    }
}
