#![forbid(unsafe_code)]
//! Block discovery and re-encryption of WFS images.
//!
//! Re-encryption runs in two strictly ordered phases:
//!
//! 1. **Discovery.** The filesystem is mounted on top of a
//!    [`RecordingBlocksDevice`] and fully walked by the [`Walker`]. Every
//!    block the walk reads is recorded, with the parameters it was read
//!    with, into an [`Inventory`].
//! 2. **Transcoding.** [`reencrypt`] replays the closed inventory: each
//!    block is read from the source under its recorded parameters and
//!    written to the destination under the destination key.
//!
//! Blocks the walk never reads (free space, unused journal space) are not
//! copied.

pub mod inventory;
pub mod job;
pub mod recorder;
pub mod transcoder;
pub mod walker;

pub use inventory::{BlockDescriptor, Inventory};
pub use job::{JobReport, ReencryptJob};
pub use recorder::RecordingBlocksDevice;
pub use transcoder::{
    NoTranscodeProgress, TranscodeObserver, TranscodeProgress, TranscodeSummary, reencrypt,
};
pub use walker::{
    ExploreFailure, ExploreObserver, ExploreProgress, ExploreTarget, NoExploreProgress, Walker,
    display_location,
};

use tracing::info;
use wfs_block::BlocksDevice;
use wfs_core::{WfsDevice, detect_device};
use wfs_error::Result;

/// Outcome of a discovery pass.
#[derive(Debug)]
pub struct Discovery {
    pub inventory: Inventory,
    /// Nodes the walk had to skip.
    pub failures: Vec<ExploreFailure>,
}

/// Walk the filesystem on `source` and inventory every block it reads.
pub fn discover(source: &dyn BlocksDevice, observer: &mut dyn ExploreObserver) -> Result<Discovery> {
    let recorder = RecordingBlocksDevice::new(source);
    let failures = {
        let wfs = WfsDevice::open(&recorder)?;
        let mut walker = Walker::new(&recorder, observer);
        walker.walk(&wfs)?;
        walker.into_failures()
    };
    let inventory = recorder.into_inventory();
    info!(
        blocks = inventory.blocks_count(),
        bytes = inventory.bytes_count(),
        bad_blocks = inventory.bad_blocks_count(),
        failures = failures.len(),
        "discovery complete"
    );
    Ok(Discovery {
        inventory,
        failures,
    })
}

/// Detect, discover and transcode from `source` to `destination`.
///
/// Detection runs first, so a wrong source key fails with
/// [`WfsError::InvalidWfsVersion`](wfs_error::WfsError::InvalidWfsVersion)
/// before anything is read or written through the recorder.
pub fn transcode_device(
    source: &dyn BlocksDevice,
    destination: &dyn BlocksDevice,
    explore: &mut dyn ExploreObserver,
    transcode: &mut dyn TranscodeObserver,
) -> Result<(Discovery, TranscodeSummary)> {
    detect_device(source)?;
    let discovery = discover(source, explore)?;
    let summary = reencrypt(&discovery.inventory, source, destination, transcode)?;
    Ok((discovery, summary))
}
