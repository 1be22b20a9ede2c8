//! Device header, quota area headers and transaction area headers.

use serde::{Deserialize, Serialize};
use wfs_types::{
    AreaGeometry, BlockNumber, ParseError, TRANSACTION_AREAS, WFS_VERSION, read_be_u32,
    write_be_u32,
};

use crate::{BlockKind, PAYLOAD_OFFSET, expect_kind, new_block};

const VERSION_OFFSET: usize = PAYLOAD_OFFSET;
const DEVICE_BLOCKS_OFFSET: usize = PAYLOAD_OFFSET + 4;
const DEVICE_AREA_OFFSET: usize = PAYLOAD_OFFSET + 8;
const AREA_FIELDS_SIZE: usize = 20;
const TRANSACTIONS_OFFSET: usize = DEVICE_AREA_OFFSET + AREA_FIELDS_SIZE;

/// Read the format version of a device header block without validating
/// anything else.
///
/// Detection calls this first: a block decrypted with the wrong key yields a
/// garbage version, which is reported apart from other corruption.
pub fn peek_version(block: &[u8]) -> Result<u32, ParseError> {
    read_be_u32(block, VERSION_OFFSET)
}

/// Layout of a quota area. All block fields are area-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaHeader {
    pub blocks_count: u32,
    pub allocator: u32,
    pub root_directory: u32,
    pub shadow_directory_1: u32,
    pub shadow_directory_2: u32,
}

impl AreaHeader {
    fn read_fields(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        let header = Self {
            blocks_count: read_be_u32(block, offset)?,
            allocator: read_be_u32(block, offset + 4)?,
            root_directory: read_be_u32(block, offset + 8)?,
            shadow_directory_1: read_be_u32(block, offset + 12)?,
            shadow_directory_2: read_be_u32(block, offset + 16)?,
        };
        header.validate()?;
        Ok(header)
    }

    fn write_fields(&self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_be_u32(block, offset, self.blocks_count)?;
        write_be_u32(block, offset + 4, self.allocator)?;
        write_be_u32(block, offset + 8, self.root_directory)?;
        write_be_u32(block, offset + 12, self.shadow_directory_1)?;
        write_be_u32(block, offset + 16, self.shadow_directory_2)
    }

    fn validate(&self) -> Result<(), ParseError> {
        if self.blocks_count == 0 {
            return Err(ParseError::InvalidField {
                field: "area_blocks_count",
                reason: "must be non-zero",
            });
        }
        let fields = [
            ("allocator", self.allocator),
            ("root_directory", self.root_directory),
            ("shadow_directory_1", self.shadow_directory_1),
            ("shadow_directory_2", self.shadow_directory_2),
        ];
        for (field, block) in fields {
            // Relative block 0 is the area header itself.
            if block == 0 || block >= self.blocks_count {
                return Err(ParseError::InvalidField {
                    field,
                    reason: "outside area",
                });
            }
        }
        Ok(())
    }

    /// Decode a quota area header block.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        expect_kind(block, BlockKind::AreaHeader)?;
        Self::read_fields(block, PAYLOAD_OFFSET)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        self.validate()?;
        let mut block = new_block(BlockKind::AreaHeader)?;
        self.write_fields(&mut block, PAYLOAD_OFFSET)?;
        Ok(block)
    }
}

/// Block 0 of the device. Doubles as the root area's header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHeader {
    pub version: u32,
    pub blocks_count: u32,
    pub root_area: AreaHeader,
    /// Absolute geometry of both transaction areas.
    pub transactions: [AreaGeometry; TRANSACTION_AREAS],
}

impl DeviceHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        expect_kind(block, BlockKind::DeviceHeader)?;
        let version = peek_version(block)?;
        if version != WFS_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported WFS version",
            });
        }
        let blocks_count = read_be_u32(block, DEVICE_BLOCKS_OFFSET)?;
        let root_area = AreaHeader::read_fields(block, DEVICE_AREA_OFFSET)?;
        if root_area.blocks_count > blocks_count {
            return Err(ParseError::InvalidField {
                field: "root_area",
                reason: "larger than device",
            });
        }

        let mut transactions = [AreaGeometry::new(BlockNumber(0), 0); TRANSACTION_AREAS];
        for (index, area) in transactions.iter_mut().enumerate() {
            let offset = TRANSACTIONS_OFFSET + index * 8;
            *area = AreaGeometry::new(
                BlockNumber(read_be_u32(block, offset)?),
                read_be_u32(block, offset + 4)?,
            );
            if area.blocks_count == 0 || area.end().0 > root_area.blocks_count {
                return Err(ParseError::InvalidField {
                    field: "transactions",
                    reason: "outside root area",
                });
            }
        }

        Ok(Self {
            version,
            blocks_count,
            root_area,
            transactions,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        self.root_area.validate()?;
        let mut block = new_block(BlockKind::DeviceHeader)?;
        write_be_u32(&mut block, VERSION_OFFSET, self.version)?;
        write_be_u32(&mut block, DEVICE_BLOCKS_OFFSET, self.blocks_count)?;
        self.root_area.write_fields(&mut block, DEVICE_AREA_OFFSET)?;
        for (index, area) in self.transactions.iter().enumerate() {
            let offset = TRANSACTIONS_OFFSET + index * 8;
            write_be_u32(&mut block, offset, area.base.0)?;
            write_be_u32(&mut block, offset + 4, area.blocks_count)?;
        }
        Ok(block)
    }
}

/// First block of a transaction area. Stored without encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAreaHeader {
    pub blocks_count: u32,
    pub sequence: u32,
}

impl TransactionAreaHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        expect_kind(block, BlockKind::TransactionArea)?;
        Ok(Self {
            blocks_count: read_be_u32(block, PAYLOAD_OFFSET)?,
            sequence: read_be_u32(block, PAYLOAD_OFFSET + 4)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut block = new_block(BlockKind::TransactionArea)?;
        write_be_u32(&mut block, PAYLOAD_OFFSET, self.blocks_count)?;
        write_be_u32(&mut block, PAYLOAD_OFFSET + 4, self.sequence)?;
        Ok(block)
    }
}
