//! Allocator state report.
//!
//! Walks every directory depth-first and, for each quota boundary, reports
//! the area's range, its allocator header counters and its coalesced free
//! ranges. Failures are collected per path and keep their place in the
//! walk; the walk continues past them.

use std::fmt;

use serde::Serialize;
use tracing::{debug, error};
use wfs_error::{Result, WfsError};
use wfs_types::{AreaGeometry, BlockNumber};

use crate::alloc::{FreeRange, FreeRangeCoalescer};
use crate::area::Quota;
use crate::directory::{Directory, Entry, child_path};
use crate::WfsDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockSpan {
    pub start: BlockNumber,
    pub end: BlockNumber,
}

impl From<AreaGeometry> for BlockSpan {
    fn from(geometry: AreaGeometry) -> Self {
        Self {
            start: geometry.base,
            end: geometry.end(),
        }
    }
}

impl fmt::Display for BlockSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:08x}-0x{:08x}]", self.start.0, self.end.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AreaReport {
    pub path: String,
    /// Quota nesting level; the root area is 0.
    pub depth: usize,
    pub area: BlockSpan,
    pub free_blocks_count: u32,
    pub free_metadata_blocks_count: u32,
    pub free_metadata_block: BlockNumber,
    /// First transaction area, reported for the root area only.
    pub transactions_area: Option<BlockSpan>,
    pub free_ranges: Vec<FreeRange>,
}

impl fmt::Display for AreaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pad = "\t".repeat(self.depth);
        writeln!(f, "{pad}Area {} {}:", self.path, self.area)?;
        writeln!(f, "{pad}\tFree blocks: 0x{:08x}", self.free_blocks_count)?;
        writeln!(
            f,
            "{pad}\tFree metadata blocks: 0x{:08x}",
            self.free_metadata_blocks_count
        )?;
        writeln!(f, "{pad}\tFree metadata block: 0x{:08x}", self.free_metadata_block.0)?;
        if let Some(transactions) = &self.transactions_area {
            writeln!(f, "{pad}\tTransactions area {transactions}")?;
        }
        writeln!(f, "{pad}\tFree ranges:")?;
        for range in &self.free_ranges {
            writeln!(f, "{pad}\t\t{range}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectFailure {
    pub path: String,
    pub error: String,
    /// Number of area reports that precede this failure in walk order.
    pub after_areas: usize,
}

impl fmt::Display for InspectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: Failed to dump {} ({})", self.path, self.error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorDump {
    pub areas: Vec<AreaReport>,
    pub failures: Vec<InspectFailure>,
}

impl AllocatorDump {
    fn fail(&mut self, path: &str, err: &WfsError) {
        error!(path, error = %err, "failed to dump");
        self.failures.push(InspectFailure {
            path: path.to_owned(),
            error: err.to_string(),
            after_areas: self.areas.len(),
        });
    }
}

impl fmt::Display for AllocatorDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut failures = self.failures.iter().peekable();
        for (index, area) in self.areas.iter().enumerate() {
            while let Some(failure) = failures.next_if(|failure| failure.after_areas <= index) {
                writeln!(f, "{failure}")?;
            }
            write!(f, "{area}")?;
        }
        for failure in failures {
            writeln!(f, "{failure}")?;
        }
        Ok(())
    }
}

/// Report the allocator state of every area on the device.
pub fn dump_allocators(device: &WfsDevice<'_>) -> Result<AllocatorDump> {
    let mut dump = AllocatorDump::default();
    let root = device.root_directory()?;
    let transactions = device.header().transactions[0];
    dump_dir(root, "/", 0, Some(transactions), &mut dump);
    Ok(dump)
}

fn dump_dir(
    dir: Directory<'_>,
    path: &str,
    depth: usize,
    transactions: Option<AreaGeometry>,
    dump: &mut AllocatorDump,
) {
    let mut depth = depth;
    if let Some(quota) = dir.quota() {
        match dump_area(&quota, path, depth, transactions) {
            Ok(report) => dump.areas.push(report),
            Err((report, err)) => {
                dump.areas.extend(report);
                dump.fail(path, &err);
            }
        }
        depth += 1;
    }

    for (name, entry) in dir {
        let child = child_path(path, &name);
        match entry {
            Ok(Entry::Directory(sub)) => dump_dir(sub, &child, depth, None, dump),
            Ok(Entry::File(_)) => {}
            Err(err) => dump.fail(&child, &err),
        }
    }
}

/// On a failure part-way through the extents, the report built so far is
/// returned alongside the error.
fn dump_area(
    quota: &Quota<'_>,
    path: &str,
    depth: usize,
    transactions: Option<AreaGeometry>,
) -> std::result::Result<AreaReport, (Option<AreaReport>, WfsError)> {
    let allocator = quota.free_blocks_allocator().map_err(|err| (None, err))?;
    let geometry = quota.area().geometry();
    debug!(path, area = %geometry.base, "dumping allocator");

    let mut report = AreaReport {
        path: path.to_owned(),
        depth,
        area: geometry.into(),
        free_blocks_count: allocator.free_blocks_count(),
        free_metadata_blocks_count: allocator.free_metadata_blocks_count(),
        free_metadata_block: allocator.free_metadata_block(),
        transactions_area: transactions.map(BlockSpan::from),
        free_ranges: Vec::new(),
    };

    let mut coalescer = FreeRangeCoalescer::new(geometry);
    for extent in allocator.extents() {
        match extent {
            Ok(extent) => report.free_ranges.extend(coalescer.push(extent)),
            Err(err) => {
                report.free_ranges.extend(coalescer.finish());
                return Err((Some(report), err));
            }
        }
    }
    report.free_ranges.extend(coalescer.finish());
    Ok(report)
}
