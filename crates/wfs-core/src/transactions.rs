//! Transaction areas.
//!
//! The device has two of them inside the root area. Only their header block
//! is interpreted; the rest of the area is journal space.

use serde::Serialize;
use wfs_block::{BlockParams, BlocksDevice, HashCheck};
use wfs_error::{Result, WfsError};
use wfs_ondisk::TransactionAreaHeader;
use wfs_types::{AreaGeometry, BlockNumber};

use crate::parse_to_wfs_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransactionsArea {
    pub index: usize,
    pub geometry: AreaGeometry,
    pub header: TransactionAreaHeader,
}

impl TransactionsArea {
    pub(crate) fn open(
        dev: &dyn BlocksDevice,
        index: usize,
        geometry: AreaGeometry,
    ) -> Result<Self> {
        let block = geometry.base;
        let buf = dev.read_block(
            block,
            &BlockParams::transaction_header(block),
            HashCheck::Embedded,
        )?;
        let header =
            TransactionAreaHeader::parse(buf.as_slice()).map_err(|e| parse_to_wfs_error(block, &e))?;
        if header.blocks_count != geometry.blocks_count {
            return Err(WfsError::Corruption {
                block: block.0,
                detail: format!(
                    "transactions area {index} header says {:#x} blocks, device header says {:#x}",
                    header.blocks_count, geometry.blocks_count
                ),
            });
        }
        Ok(Self {
            index,
            geometry,
            header,
        })
    }

    #[must_use]
    pub fn start(&self) -> BlockNumber {
        self.geometry.base
    }

    #[must_use]
    pub fn end(&self) -> BlockNumber {
        self.geometry.end()
    }
}
