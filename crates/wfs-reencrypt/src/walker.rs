//! Full logical traversal of a mounted filesystem.
//!
//! The walker touches every structure that owns storage so that, when it
//! runs on top of a [`RecordingBlocksDevice`], the resulting inventory covers
//! every live block:
//!
//! 1. both transaction areas,
//! 2. for every quota boundary outside shadow content: the free-block
//!    allocator's header and whole extent node chain, then both shadow
//!    directories,
//! 3. every directory and every byte of every file.
//!
//! A node that fails to resolve is reported and skipped; its siblings are
//! still walked.

use std::borrow::Cow;
use std::fmt;

use tracing::{debug, error};
use wfs_core::{Directory, Entry, File, Quota, WfsDevice, child_path};
use wfs_error::{Result, WfsError};
use wfs_types::TRANSACTION_AREAS;

use crate::recorder::RecordingBlocksDevice;

/// Width of the location shown in progress reports.
pub const LOCATION_WIDTH: usize = 64;

/// File contents are pulled through the reader in chunks of this size.
const READ_CHUNK: usize = 0x2000;

/// Cumulative discovery state after one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExploreProgress<'a> {
    pub blocks: usize,
    pub bytes: u64,
    /// What is being explored, at most [`LOCATION_WIDTH`] characters.
    pub location: &'a str,
}

/// Receives progress during discovery. Purely observational.
pub trait ExploreObserver {
    fn on_progress(&mut self, progress: &ExploreProgress<'_>);
}

/// Observer that ignores progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExploreProgress;

impl ExploreObserver for NoExploreProgress {
    fn on_progress(&mut self, _progress: &ExploreProgress<'_>) {}
}

impl<F> ExploreObserver for F
where
    F: FnMut(&ExploreProgress<'_>),
{
    fn on_progress(&mut self, progress: &ExploreProgress<'_>) {
        self(progress);
    }
}

/// Shorten `location` to [`LOCATION_WIDTH`] characters, ending in `...`
/// when cut.
#[must_use]
pub fn display_location(location: &str) -> Cow<'_, str> {
    if location.chars().count() <= LOCATION_WIDTH {
        return Cow::Borrowed(location);
    }
    let kept: String = location.chars().take(LOCATION_WIDTH - 3).collect();
    Cow::Owned(format!("{kept}..."))
}

/// The structure a traversal failure was hit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExploreTarget {
    /// Transaction area 1 or 2.
    TransactionsArea(usize),
    FreeBlocksAllocator,
    /// Shadow directory 1 or 2.
    ShadowDirectory(u8),
    /// A directory entry that could not be resolved.
    Entry,
    /// File contents that could not be read.
    FileData,
}

impl fmt::Display for ExploreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransactionsArea(index) => write!(f, "transactions area {}", index + 1),
            Self::FreeBlocksAllocator => f.write_str("free blocks allocator"),
            Self::ShadowDirectory(index) => write!(f, "shadow dir {index}"),
            Self::Entry => f.write_str("entry"),
            Self::FileData => f.write_str("file data"),
        }
    }
}

/// A node the walker had to skip.
#[derive(Debug)]
pub struct ExploreFailure {
    pub path: String,
    pub target: ExploreTarget,
    pub error: WfsError,
}

impl fmt::Display for ExploreFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            ExploreTarget::Entry => {
                write!(f, "Failed to explore {} ({})", self.path, self.error)
            }
            ExploreTarget::FileData => write!(f, "Failed to read {} ({})", self.path, self.error),
            ExploreTarget::TransactionsArea(_) => {
                write!(f, "Failed to explore {} ({})", self.target, self.error)
            }
            ExploreTarget::FreeBlocksAllocator | ExploreTarget::ShadowDirectory(_) => write!(
                f,
                "Failed to explore {} {} ({})",
                self.path, self.target, self.error
            ),
        }
    }
}

/// Drives a traversal through a [`RecordingBlocksDevice`].
pub struct Walker<'r, 'o> {
    recorder: &'r RecordingBlocksDevice<'r>,
    observer: &'o mut dyn ExploreObserver,
    failures: Vec<ExploreFailure>,
}

impl<'r, 'o> Walker<'r, 'o> {
    pub fn new(recorder: &'r RecordingBlocksDevice<'r>, observer: &'o mut dyn ExploreObserver) -> Self {
        Self {
            recorder,
            observer,
            failures: Vec::new(),
        }
    }

    /// Walk everything reachable from `wfs`. Only a failure to open the root
    /// directory is returned as an error; everything else is collected.
    pub fn walk(&mut self, wfs: &WfsDevice<'_>) -> Result<()> {
        self.explore_transactions(wfs);
        let root = wfs.root_directory()?;
        self.explore_dir(root, "/", false);
        Ok(())
    }

    #[must_use]
    pub fn into_failures(self) -> Vec<ExploreFailure> {
        self.failures
    }

    fn report(&mut self, location: &str) {
        let (blocks, bytes) = self.recorder.totals();
        let location = display_location(location);
        self.observer.on_progress(&ExploreProgress {
            blocks,
            bytes,
            location: &location,
        });
    }

    fn fail(&mut self, path: &str, target: ExploreTarget, error: WfsError) {
        error!(path, target = %target, error = %error, "failed to explore");
        self.failures.push(ExploreFailure {
            path: path.to_owned(),
            target,
            error,
        });
    }

    fn explore_transactions(&mut self, wfs: &WfsDevice<'_>) {
        self.report("transactions");
        for index in 0..TRANSACTION_AREAS {
            match wfs.transactions_area(index) {
                Ok(area) => debug!(index, start = %area.start(), "explored transactions area"),
                Err(err) => self.fail("/", ExploreTarget::TransactionsArea(index), err),
            }
        }
    }

    fn explore_dir(&mut self, dir: Directory<'_>, path: &str, shadow: bool) {
        if !shadow {
            if let Some(quota) = dir.quota() {
                self.explore_quota(&quota, path);
            }
        }

        self.report(path);
        for (name, entry) in dir {
            let child = child_path(path, &name);
            match entry {
                Ok(Entry::Directory(sub)) => self.explore_dir(sub, &child, shadow),
                Ok(Entry::File(file)) => {
                    self.report(&child);
                    self.explore_file(&file, &child);
                }
                Err(err) => self.fail(&child, ExploreTarget::Entry, err),
            }
            self.report(path);
        }
    }

    /// Shadow directories are walked as plain metadata trees: quota
    /// boundaries inside them are not treated as areas.
    fn explore_quota(&mut self, quota: &Quota<'_>, path: &str) {
        self.report(&format!("{path} free blocks allocator"));
        match quota.free_blocks_allocator() {
            // Extent contents are not checked here; every node is read
            // until the chain ends or breaks.
            Ok(allocator) => {
                if let Some(Err(err)) = allocator.nodes().find(Result::is_err) {
                    self.fail(path, ExploreTarget::FreeBlocksAllocator, err);
                }
            }
            Err(err) => self.fail(path, ExploreTarget::FreeBlocksAllocator, err),
        }

        self.report(&format!("{path} shadow dir"));
        for index in [1_u8, 2] {
            let shadow = if index == 1 {
                quota.shadow_directory_1()
            } else {
                quota.shadow_directory_2()
            };
            match shadow {
                Ok(dir) => {
                    let shadow_path = child_path(path, &format!(".shadow_dir_{index}"));
                    self.explore_dir(dir, &shadow_path, true);
                }
                Err(err) => self.fail(path, ExploreTarget::ShadowDirectory(index), err),
            }
        }
    }

    fn explore_file(&mut self, file: &File<'_>, path: &str) {
        let mut reader = file.reader();
        let mut chunk = vec![0_u8; READ_CHUNK];
        while reader.remaining() > 0 {
            match reader.read_chunk(&mut chunk) {
                Ok(0) => {
                    self.fail(
                        path,
                        ExploreTarget::FileData,
                        WfsError::Format(format!("{} bytes missing", reader.remaining())),
                    );
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    self.fail(path, ExploreTarget::FileData, err);
                    return;
                }
            }
        }
    }
}

impl fmt::Debug for Walker<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Walker")
            .field("recorder", &self.recorder)
            .field("failures", &self.failures.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_locations_are_kept() {
        assert_eq!(display_location("/usr/save"), "/usr/save");
        let exact = "x".repeat(LOCATION_WIDTH);
        assert!(matches!(display_location(&exact), Cow::Borrowed(_)));
    }

    #[test]
    fn long_locations_are_cut_to_width() {
        let long = format!("/{}", "a".repeat(100));
        let shown = display_location(&long);
        assert_eq!(shown.chars().count(), LOCATION_WIDTH);
        assert!(shown.ends_with("..."));
        assert!(shown.starts_with("/aaa"));
    }

    #[test]
    fn failure_messages_name_the_structure() {
        let failure = ExploreFailure {
            path: "/usr".to_owned(),
            target: ExploreTarget::ShadowDirectory(2),
            error: WfsError::HashMismatch { block: 9 },
        };
        let text = failure.to_string();
        assert!(text.starts_with("Failed to explore /usr shadow dir 2 ("), "{text}");

        let transactions = ExploreFailure {
            path: "/".to_owned(),
            target: ExploreTarget::TransactionsArea(1),
            error: WfsError::HashMismatch { block: 5 },
        };
        assert!(transactions.to_string().starts_with("Failed to explore transactions area 2 ("));
    }
}
