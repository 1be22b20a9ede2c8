//! Recording block proxy.
//!
//! Wraps the source [`BlocksDevice`] for the duration of discovery and
//! records every block read through it into an [`Inventory`].

use parking_lot::Mutex;
use tracing::{trace, warn};
use wfs_block::{BlockBuf, BlockParams, BlocksDevice, HashCheck, HashUpdate};
use wfs_error::Result;
use wfs_types::{BlockNumber, DEVICE_HEADER_BLOCK};

use crate::inventory::Inventory;

/// [`BlocksDevice`] that records each read into an [`Inventory`].
///
/// Reads must be hash-checked so that a recorded block is known to decrypt
/// correctly under the source key. A block is expected to be read at most
/// once per discovery pass; a second read is a traversal defect. Debug
/// builds assert on it, release builds keep the first descriptor and count
/// the revisit.
pub struct RecordingBlocksDevice<'a> {
    inner: &'a dyn BlocksDevice,
    inventory: Mutex<Inventory>,
}

impl<'a> RecordingBlocksDevice<'a> {
    #[must_use]
    pub fn new(inner: &'a dyn BlocksDevice) -> Self {
        Self {
            inner,
            inventory: Mutex::new(Inventory::new()),
        }
    }

    /// Running totals: readable blocks and their bytes.
    #[must_use]
    pub fn totals(&self) -> (usize, u64) {
        let inventory = self.inventory.lock();
        (inventory.blocks_count(), inventory.bytes_count())
    }

    #[must_use]
    pub fn into_inventory(self) -> Inventory {
        self.inventory.into_inner()
    }

    fn observe(&self, block: BlockNumber, params: &BlockParams, ok: bool) {
        let mut inventory = self.inventory.lock();
        debug_assert!(
            !inventory.contains(block),
            "block {block} read twice during discovery"
        );
        let fresh = if ok {
            inventory.record(block, *params)
        } else {
            inventory.record_bad(block, *params)
        };
        if !fresh {
            warn!(block = %block, "block observed again during discovery; keeping first descriptor");
        }
    }
}

impl std::fmt::Debug for RecordingBlocksDevice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (blocks, bytes) = self.totals();
        f.debug_struct("RecordingBlocksDevice")
            .field("blocks", &blocks)
            .field("bytes", &bytes)
            .finish_non_exhaustive()
    }
}

impl BlocksDevice for RecordingBlocksDevice<'_> {
    fn read_block(
        &self,
        block: BlockNumber,
        params: &BlockParams,
        hash: HashCheck<'_>,
    ) -> Result<BlockBuf> {
        debug_assert!(hash.is_checked(), "discovery read of {block} skips the hash check");
        match self.inner.read_block(block, params, hash) {
            Ok(buf) => {
                trace!(block = %block, size = params.data_size, "recorded block");
                self.observe(block, params, true);
                Ok(buf)
            }
            // A failed probe of the header block is not a bad block.
            Err(err) if block == DEVICE_HEADER_BLOCK => Err(err),
            Err(err) => {
                warn!(block = %block, error = %err, "recording bad block");
                self.observe(block, params, false);
                Err(err)
            }
        }
    }

    fn write_block(
        &self,
        block: BlockNumber,
        params: &BlockParams,
        data: &[u8],
        hash: HashUpdate,
    ) -> Result<()> {
        self.inner.write_block(block, params, data, hash)
    }

    fn blocks_count(&self) -> u32 {
        self.inner.blocks_count()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
