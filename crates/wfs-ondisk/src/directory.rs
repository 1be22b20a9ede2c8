//! Directory blocks.
//!
//! A directory is a chain of blocks linked through `next` (0 ends the chain).
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x18 | 4 | next directory block (area-relative, 0 = none) |
//! | 0x1C | 2 | entry count |
//! | 0x1E | .. | entries: kind u8, name length u8, name, block u32 |

use serde::{Deserialize, Serialize};
use wfs_types::{
    ParseError, ensure_slice, read_be_u16, read_be_u32, write_be_u16, write_be_u32, write_bytes,
};

use crate::{BlockKind, METADATA_BLOCK_SIZE, PAYLOAD_OFFSET, expect_kind, new_block};

const NEXT_OFFSET: usize = PAYLOAD_OFFSET;
const COUNT_OFFSET: usize = PAYLOAD_OFFSET + 4;
const ENTRIES_OFFSET: usize = PAYLOAD_OFFSET + 6;

/// Longest entry name in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Bytes available for entries in one directory block.
pub const DIRECTORY_PAYLOAD: usize = METADATA_BLOCK_SIZE - ENTRIES_OFFSET;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    /// A directory that owns a sub-area; `block` points at its area header.
    Quota,
}

impl EntryKind {
    const fn code(self) -> u8 {
        match self {
            Self::File => 1,
            Self::Directory => 2,
            Self::Quota => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self, ParseError> {
        match code {
            1 => Ok(Self::File),
            2 => Ok(Self::Directory),
            3 => Ok(Self::Quota),
            _ => Err(ParseError::InvalidField {
                field: "entry_kind",
                reason: "unknown entry kind",
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Area-relative block of the file header, directory block or area header.
    pub block: u32,
}

impl DirectoryEntry {
    /// Encoded size of an entry with this name.
    #[must_use]
    pub fn encoded_len(name: &str) -> usize {
        2 + name.len() + 4
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryBlock {
    pub next: u32,
    pub entries: Vec<DirectoryEntry>,
}

impl DirectoryBlock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        expect_kind(block, BlockKind::Directory)?;
        let next = read_be_u32(block, NEXT_OFFSET)?;
        let count = read_be_u16(block, COUNT_OFFSET)?;

        let mut entries = Vec::with_capacity(usize::from(count));
        let mut offset = ENTRIES_OFFSET;
        for _ in 0..count {
            let head = ensure_slice(block, offset, 2)?;
            let kind = EntryKind::from_code(head[0])?;
            let name_len = usize::from(head[1]);
            if name_len == 0 {
                return Err(ParseError::InvalidField {
                    field: "name",
                    reason: "empty",
                });
            }
            let name_bytes = ensure_slice(block, offset + 2, name_len)?;
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| ParseError::InvalidField {
                    field: "name",
                    reason: "not UTF-8",
                })?
                .to_owned();
            let target = read_be_u32(block, offset + 2 + name_len)?;
            entries.push(DirectoryEntry {
                name,
                kind,
                block: target,
            });
            offset += DirectoryEntry::encoded_len(&entries[entries.len() - 1].name);
        }

        Ok(Self { next, entries })
    }

    /// Bytes this block's entries occupy.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| DirectoryEntry::encoded_len(&entry.name))
            .sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        if self.payload_len() > DIRECTORY_PAYLOAD {
            return Err(ParseError::InvalidField {
                field: "entries",
                reason: "do not fit in one block",
            });
        }
        let count = u16::try_from(self.entries.len()).map_err(|_| ParseError::InvalidField {
            field: "entries",
            reason: "too many entries",
        })?;

        let mut block = new_block(BlockKind::Directory)?;
        write_be_u32(&mut block, NEXT_OFFSET, self.next)?;
        write_be_u16(&mut block, COUNT_OFFSET, count)?;

        let mut offset = ENTRIES_OFFSET;
        for entry in &self.entries {
            let name_len = u8::try_from(entry.name.len())
                .ok()
                .filter(|len| *len > 0)
                .ok_or(ParseError::InvalidField {
                    field: "name",
                    reason: "length must be 1..=255 bytes",
                })?;
            write_bytes(&mut block, offset, &[entry.kind.code(), name_len])?;
            write_bytes(&mut block, offset + 2, entry.name.as_bytes())?;
            write_be_u32(&mut block, offset + 2 + entry.name.len(), entry.block)?;
            offset += DirectoryEntry::encoded_len(&entry.name);
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: EntryKind, block: u32) -> DirectoryEntry {
        DirectoryEntry {
            name: name.to_owned(),
            kind,
            block,
        }
    }

    #[test]
    fn entries_keep_their_order_and_targets() {
        let dir = DirectoryBlock {
            next: 17,
            entries: vec![
                entry("save", EntryKind::Directory, 20),
                entry("title.bin", EntryKind::File, 21),
                entry("usr", EntryKind::Quota, 64),
            ],
        };
        let block = dir.encode().expect("encode");
        let parsed = DirectoryBlock::parse(&block).expect("parse");
        assert_eq!(parsed, dir);
        assert_eq!(parsed.payload_len(), 6 + 4 + 6 + 9 + 6 + 3);
    }

    #[test]
    fn empty_directory_block() {
        let block = DirectoryBlock::default().encode().expect("encode");
        let parsed = DirectoryBlock::parse(&block).expect("parse");
        assert_eq!(parsed.next, 0);
        assert!(parsed.entries.is_empty());
    }

    #[test]
    fn names_are_length_checked() {
        let long = DirectoryBlock {
            next: 0,
            entries: vec![entry(&"x".repeat(MAX_NAME_LEN + 1), EntryKind::File, 1)],
        };
        assert!(long.encode().is_err());

        let empty = DirectoryBlock {
            next: 0,
            entries: vec![entry("", EntryKind::File, 1)],
        };
        assert!(empty.encode().is_err());
    }

    #[test]
    fn overfull_block_is_rejected() {
        let entries = (0..200)
            .map(|i| entry(&format!("{i:0>24}"), EntryKind::File, i))
            .collect();
        let dir = DirectoryBlock { next: 0, entries };
        assert!(dir.payload_len() > DIRECTORY_PAYLOAD);
        assert!(dir.encode().is_err());
    }

    #[test]
    fn unknown_kind_and_truncated_entries_fail() {
        let dir = DirectoryBlock {
            next: 0,
            entries: vec![entry("a", EntryKind::File, 5)],
        };
        let mut block = dir.encode().expect("encode");
        block[ENTRIES_OFFSET] = 9;
        assert!(DirectoryBlock::parse(&block).is_err());

        let mut block = dir.encode().expect("encode");
        write_be_u16(&mut block, COUNT_OFFSET, u16::MAX).expect("count");
        assert!(DirectoryBlock::parse(&block).is_err());
    }

    #[test]
    fn serializes_kind_in_snake_case() {
        let json = serde_json::to_string(&entry("q", EntryKind::Quota, 3)).expect("json");
        assert!(json.contains("\"quota\""));
    }
}
