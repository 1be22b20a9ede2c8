//! Directories and their entries.

use std::collections::BTreeSet;
use std::vec;

use wfs_error::{Result, WfsError};
use wfs_ondisk::{DirectoryBlock, DirectoryEntry, EntryKind};
use wfs_types::BlockNumber;

use crate::area::{Area, Quota};
use crate::file::File;
use crate::parse_to_wfs_error;

/// Path of `name` inside the directory at `parent` ("/" for the root).
#[must_use]
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// A resolved directory entry.
#[derive(Debug)]
pub enum Entry<'d> {
    File(File<'d>),
    Directory(Directory<'d>),
}

impl Entry<'_> {
    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory(_))
    }
}

#[derive(Debug)]
pub struct Directory<'d> {
    area: Area<'d>,
    relative: u32,
    block: BlockNumber,
    first: DirectoryBlock,
    is_quota: bool,
}

impl<'d> Directory<'d> {
    /// Read the first block of the directory at `relative`.
    pub(crate) fn open(area: Area<'d>, relative: u32, is_quota: bool) -> Result<Self> {
        let (block, buf) = area.read_metadata(relative)?;
        let first = DirectoryBlock::parse(buf.as_slice()).map_err(|e| parse_to_wfs_error(block, &e))?;
        Ok(Self {
            area,
            relative,
            block,
            first,
            is_quota,
        })
    }

    /// Absolute block of the directory's first block.
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    #[must_use]
    pub fn area(&self) -> &Area<'d> {
        &self.area
    }

    /// Whether this directory is the root of its area.
    #[must_use]
    pub fn is_quota(&self) -> bool {
        self.is_quota
    }

    #[must_use]
    pub fn quota(&self) -> Option<Quota<'d>> {
        self.is_quota.then(|| Quota::new(self.area.clone()))
    }

    /// Iterate the entries. Further directory blocks are read as the
    /// iterator reaches them, so iterating twice re-reads them.
    #[must_use]
    pub fn entries(self) -> Entries<'d> {
        let mut visited = BTreeSet::new();
        visited.insert(self.relative);
        Entries {
            area: self.area,
            current: self.first.entries.into_iter(),
            next: self.first.next,
            visited,
        }
    }
}

impl<'d> IntoIterator for Directory<'d> {
    type Item = (String, Result<Entry<'d>>);
    type IntoIter = Entries<'d>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries()
    }
}

/// Lazy iterator over `(name, entry)` pairs.
///
/// Resolving an entry reads its first block. A directory block that cannot be
/// read ends the iteration after yielding the error under a placeholder name.
#[derive(Debug)]
pub struct Entries<'d> {
    area: Area<'d>,
    current: vec::IntoIter<DirectoryEntry>,
    next: u32,
    visited: BTreeSet<u32>,
}

impl<'d> Entries<'d> {
    fn resolve(&self, entry: &DirectoryEntry) -> Result<Entry<'d>> {
        match entry.kind {
            EntryKind::File => File::open(self.area.clone(), entry.block).map(Entry::File),
            EntryKind::Directory => {
                Directory::open(self.area.clone(), entry.block, false).map(Entry::Directory)
            }
            EntryKind::Quota => self
                .area
                .open_sub_area(entry.block)?
                .root_directory()
                .map(Entry::Directory),
        }
    }

    fn advance_block(&mut self) -> Option<Result<()>> {
        if self.next == 0 {
            return None;
        }
        let relative = std::mem::take(&mut self.next);
        if !self.visited.insert(relative) {
            return Some(Err(WfsError::Corruption {
                block: self.area.to_absolute(relative).0,
                detail: "directory block chain loops".to_owned(),
            }));
        }
        let loaded = self.area.read_metadata(relative).and_then(|(block, buf)| {
            DirectoryBlock::parse(buf.as_slice()).map_err(|e| parse_to_wfs_error(block, &e))
        });
        Some(loaded.map(|dir_block| {
            self.next = dir_block.next;
            self.current = dir_block.entries.into_iter();
        }))
    }
}

impl<'d> Iterator for Entries<'d> {
    type Item = (String, Result<Entry<'d>>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.current.next() {
                let resolved = self.resolve(&entry);
                return Some((entry.name, resolved));
            }
            let relative = self.next;
            match self.advance_block()? {
                Ok(()) => {}
                Err(err) => {
                    let name = format!("<directory block {}>", self.area.to_absolute(relative));
                    return Some((name, Err(err)));
                }
            }
        }
    }
}
