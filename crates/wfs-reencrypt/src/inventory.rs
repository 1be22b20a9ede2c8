//! Block inventory built during discovery.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};
use wfs_block::BlockParams;
use wfs_types::BlockNumber;

/// One discovered block: where it lives and how it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockDescriptor {
    pub block_number: BlockNumber,
    #[serde(flatten)]
    pub params: BlockParams,
}

/// Blocks observed during discovery, ordered by block number.
///
/// `blocks` holds every block that was read successfully; `bad_blocks` holds
/// the attempted parameters of every block whose read failed. A block number
/// is in at most one of the two.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    blocks: BTreeMap<BlockNumber, BlockParams>,
    bad_blocks: BTreeMap<BlockNumber, BlockParams>,
    revisits: u64,
}

impl Inventory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `block` has been observed, successfully or not.
    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        self.blocks.contains_key(&block) || self.bad_blocks.contains_key(&block)
    }

    /// Record a successful read. Returns `false` (and keeps the first
    /// descriptor) if the block was already observed.
    pub fn record(&mut self, block: BlockNumber, params: BlockParams) -> bool {
        if self.contains(block) {
            self.revisits += 1;
            return false;
        }
        self.blocks.insert(block, params);
        true
    }

    /// Record a failed read. Same revisit rule as [`Inventory::record`].
    pub fn record_bad(&mut self, block: BlockNumber, params: BlockParams) -> bool {
        if self.contains(block) {
            self.revisits += 1;
            return false;
        }
        self.bad_blocks.insert(block, params);
        true
    }

    #[must_use]
    pub fn get(&self, block: BlockNumber) -> Option<&BlockParams> {
        self.blocks.get(&block)
    }

    /// Number of readable blocks.
    #[must_use]
    pub fn blocks_count(&self) -> usize {
        self.blocks.len()
    }

    /// Sum of `data_size` over readable blocks.
    #[must_use]
    pub fn bytes_count(&self) -> u64 {
        self.blocks
            .values()
            .map(|params| u64::from(params.data_size))
            .sum()
    }

    #[must_use]
    pub fn bad_blocks_count(&self) -> usize {
        self.bad_blocks.len()
    }

    /// Times a block was observed again after being recorded.
    #[must_use]
    pub fn revisits(&self) -> u64 {
        self.revisits
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Readable blocks in ascending block order.
    pub fn iter(&self) -> impl Iterator<Item = BlockDescriptor> + '_ {
        descriptors(&self.blocks)
    }

    /// Unreadable blocks in ascending block order.
    pub fn bad_blocks(&self) -> impl Iterator<Item = BlockDescriptor> + '_ {
        descriptors(&self.bad_blocks)
    }

    /// The readable block map.
    #[must_use]
    pub fn blocks(&self) -> &BTreeMap<BlockNumber, BlockParams> {
        &self.blocks
    }
}

fn descriptors(
    map: &BTreeMap<BlockNumber, BlockParams>,
) -> impl Iterator<Item = BlockDescriptor> + '_ {
    map.iter().map(|(block, params)| BlockDescriptor {
        block_number: *block,
        params: *params,
    })
}

impl Serialize for Inventory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Inventory", 5)?;
        state.serialize_field("blocks_count", &self.blocks_count())?;
        state.serialize_field("bytes_count", &self.bytes_count())?;
        state.serialize_field("revisits", &self.revisits)?;
        state.serialize_field("blocks", &self.iter().collect::<Vec<_>>())?;
        state.serialize_field("bad_blocks", &self.bad_blocks().collect::<Vec<_>>())?;
        state.end()
    }
}
