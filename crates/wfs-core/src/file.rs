//! Regular files and their sequential reader.

use std::io;

use wfs_error::{Result, WfsError};
use wfs_ondisk::{DataExtent, FileHeader};
use wfs_types::BlockNumber;

use crate::area::Area;
use crate::parse_to_wfs_error;

#[derive(Debug)]
pub struct File<'d> {
    area: Area<'d>,
    block: BlockNumber,
    header: FileHeader,
}

impl<'d> File<'d> {
    pub(crate) fn open(area: Area<'d>, relative: u32) -> Result<Self> {
        let (block, buf) = area.read_metadata(relative)?;
        let header = FileHeader::parse(buf.as_slice()).map_err(|e| parse_to_wfs_error(block, &e))?;
        Ok(Self {
            area,
            block,
            header,
        })
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.header.size
    }

    /// Absolute block of the file header.
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    #[must_use]
    pub fn extents(&self) -> &[DataExtent] {
        &self.header.extents
    }

    /// Sequential reader over the file contents. Each data block is read
    /// once, when the reader first needs bytes from it.
    #[must_use]
    pub fn reader(&self) -> FileReader<'d> {
        FileReader {
            area: self.area.clone(),
            extents: self.header.extents.clone(),
            next_extent: 0,
            buffer: Vec::new(),
            position: 0,
            remaining: self.header.size,
        }
    }

    /// Read the whole file into memory.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader();
        let mut out = Vec::with_capacity(usize::try_from(self.size()).unwrap_or(0));
        let mut chunk = [0_u8; 0x2000];
        loop {
            let read = reader.read_chunk(&mut chunk)?;
            if read == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..read]);
        }
        Ok(out)
    }
}

#[derive(Debug)]
pub struct FileReader<'d> {
    area: Area<'d>,
    extents: Vec<DataExtent>,
    next_extent: usize,
    buffer: Vec<u8>,
    position: usize,
    remaining: u64,
}

impl FileReader<'_> {
    /// Bytes not yet returned.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Copy up to `buf.len()` bytes. Returns 0 at end of file.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        if self.position == self.buffer.len() {
            let extent = self.extents.get(self.next_extent).ok_or_else(|| {
                WfsError::Format(format!(
                    "file data ends with {} bytes unread",
                    self.remaining
                ))
            })?;
            self.buffer = self.area.read_data(extent)?.into_inner();
            self.next_extent += 1;
            self.position = 0;
        }

        let available = self.buffer.len() - self.position;
        let wanted = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        let count = buf.len().min(available).min(wanted);
        buf[..count].copy_from_slice(&self.buffer[self.position..self.position + count]);
        self.position += count;
        self.remaining -= count as u64;
        Ok(count)
    }
}

impl io::Read for FileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf).map_err(io::Error::other)
    }
}
