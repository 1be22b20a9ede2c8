//! Transcoding engine: replays an inventory from one device to another.

use serde::Serialize;
use tracing::{debug, info};
use wfs_block::{BlocksDevice, HashCheck, HashUpdate};
use wfs_error::{Result, WfsError};

use crate::inventory::Inventory;

/// Cumulative transcoding state after one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeProgress {
    pub blocks_done: usize,
    pub blocks_total: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl TranscodeProgress {
    /// Share of bytes done, 0.0 to 100.0.
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.bytes_done as f64 / self.bytes_total as f64;
        ratio * 100.0
    }
}

pub trait TranscodeObserver {
    fn on_progress(&mut self, progress: &TranscodeProgress);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoTranscodeProgress;

impl TranscodeObserver for NoTranscodeProgress {
    fn on_progress(&mut self, _progress: &TranscodeProgress) {}
}

impl<F> TranscodeObserver for F
where
    F: FnMut(&TranscodeProgress),
{
    fn on_progress(&mut self, progress: &TranscodeProgress) {
        self(progress);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TranscodeSummary {
    pub blocks: usize,
    pub bytes: u64,
    /// Bad blocks found by discovery, left untouched on the destination.
    pub skipped_bad_blocks: usize,
}

/// Copy every inventoried block from `source` to `destination`.
///
/// Each block is read under its recorded parameters without hash
/// verification (discovery already verified it) and written at the same
/// block number with the same parameters under the destination's key,
/// carrying its stored hash verbatim. Blocks are processed in ascending
/// order. The destination is synced before returning.
pub fn reencrypt(
    inventory: &Inventory,
    source: &dyn BlocksDevice,
    destination: &dyn BlocksDevice,
    observer: &mut dyn TranscodeObserver,
) -> Result<TranscodeSummary> {
    if destination.blocks_count() < source.blocks_count() {
        return Err(WfsError::NoSpace);
    }

    let mut progress = TranscodeProgress {
        blocks_done: 0,
        blocks_total: inventory.blocks_count(),
        bytes_done: 0,
        bytes_total: inventory.bytes_count(),
    };
    info!(
        blocks = progress.blocks_total,
        bytes = progress.bytes_total,
        bad_blocks = inventory.bad_blocks_count(),
        "re-encrypting"
    );

    for descriptor in inventory.iter() {
        let block = descriptor.block_number;
        let params = descriptor.params;
        let data = source.read_block(block, &params, HashCheck::Skip)?;
        destination.write_block(block, &params, data.as_slice(), HashUpdate::Keep)?;

        progress.blocks_done += 1;
        progress.bytes_done += u64::from(params.data_size);
        observer.on_progress(&progress);
    }
    destination.sync()?;
    debug!(blocks = progress.blocks_done, "destination synced");

    Ok(TranscodeSummary {
        blocks: progress.blocks_done,
        bytes: progress.bytes_done,
        skipped_bad_blocks: inventory.bad_blocks_count(),
    })
}
