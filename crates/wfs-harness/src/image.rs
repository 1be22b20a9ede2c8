//! Synthetic image builder.
//!
//! Lays out a complete image from an [`ImageSpec`]. Every area is filled
//! front to back:
//!
//! ```text
//! rel 0            area header (device header for the root area)
//! rel 1..          transaction areas (root area only)
//!                  allocator header, shadow directory 1 (and its contents),
//!                  shadow directory 2
//!                  directory blocks, file headers, data, sub-quotas (carved whole)
//!                  extent nodes
//! tail             free space, described in 16-block extents
//! ```
//!
//! Every block written is recorded in [`BuiltImage::blocks`] together with
//! the parameters it was written with.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use tracing::debug;
use wfs_block::{BlockParams, BlocksDevice, HashUpdate};
use wfs_crypto::block_hash;
use wfs_ondisk::alloc::MAX_NODE_EXTENTS;
use wfs_ondisk::directory::{DIRECTORY_PAYLOAD, MAX_NAME_LEN};
use wfs_ondisk::file::MAX_FILE_EXTENTS;
use wfs_ondisk::{
    AllocatorHeader, AreaHeader, DataExtent, DeviceHeader, DirectoryBlock, DirectoryEntry,
    EntryKind, ExtentNode, FileHeader, NodeExtent, TransactionAreaHeader,
};
use wfs_types::{
    AreaGeometry, BlockNumber, LARGE_BLOCK_BLOCKS, LARGE_BLOCK_SIZE, TRANSACTION_AREAS,
    WFS_VERSION, blocks_for_bytes, round_up_to_sector,
};

/// Blocks per free extent written by the builder.
pub const FREE_EXTENT_BLOCKS: u32 = 16;

fn default_transaction_blocks() -> u32 {
    4
}

/// Description of a whole image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Device size in basic blocks; the root area spans all of it.
    pub blocks_count: u32,
    /// Size of each of the two transaction areas.
    #[serde(default = "default_transaction_blocks")]
    pub transaction_blocks: u32,
    #[serde(default)]
    pub entries: Vec<NodeSpec>,
    /// Contents of the root area's first shadow directory.
    #[serde(default)]
    pub shadow_entries: Vec<NodeSpec>,
}

impl ImageSpec {
    #[must_use]
    pub fn new(blocks_count: u32, entries: Vec<NodeSpec>) -> Self {
        Self {
            blocks_count,
            transaction_blocks: default_transaction_blocks(),
            entries,
            shadow_entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeSpec {
    /// A file holding `text` if given, otherwise `size` pattern bytes.
    File {
        name: String,
        #[serde(default)]
        size: u64,
        #[serde(default)]
        seed: u8,
        #[serde(default)]
        text: Option<String>,
    },
    Dir {
        name: String,
        #[serde(default)]
        entries: Vec<NodeSpec>,
    },
    /// A directory owning a sub-area of `blocks` blocks. `shadow` fills
    /// the area's first shadow directory.
    Quota {
        name: String,
        blocks: u32,
        #[serde(default)]
        entries: Vec<NodeSpec>,
        #[serde(default)]
        shadow: Vec<NodeSpec>,
    },
}

impl NodeSpec {
    #[must_use]
    pub fn text(name: &str, text: &str) -> Self {
        Self::File {
            name: name.to_owned(),
            size: 0,
            seed: 0,
            text: Some(text.to_owned()),
        }
    }

    #[must_use]
    pub fn pattern(name: &str, size: u64, seed: u8) -> Self {
        Self::File {
            name: name.to_owned(),
            size,
            seed,
            text: None,
        }
    }

    #[must_use]
    pub fn dir(name: &str, entries: Vec<NodeSpec>) -> Self {
        Self::Dir {
            name: name.to_owned(),
            entries,
        }
    }

    #[must_use]
    pub fn quota(name: &str, blocks: u32, entries: Vec<NodeSpec>) -> Self {
        Self::Quota {
            name: name.to_owned(),
            blocks,
            entries,
            shadow: Vec::new(),
        }
    }

    /// Put `entries` in the first shadow directory of a quota.
    #[must_use]
    pub fn with_shadow(mut self, entries: Vec<NodeSpec>) -> Self {
        if let Self::Quota { shadow, .. } = &mut self {
            *shadow = entries;
        }
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } | Self::Dir { name, .. } | Self::Quota { name, .. } => name,
        }
    }
}

/// Deterministic file contents for a pattern file.
#[must_use]
pub fn pattern_bytes(size: u64, seed: u8) -> Vec<u8> {
    (0..size)
        .map(|i| {
            let mixed = i.wrapping_mul(31).wrapping_add(i >> 12).wrapping_add(u64::from(seed));
            (mixed % 251) as u8
        })
        .collect()
}

/// What the builder wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuiltImage {
    /// Every written block and the parameters it was written with.
    pub blocks: BTreeMap<BlockNumber, BlockParams>,
    /// First block of every path: directory block, file header, or the
    /// root directory of a quota.
    pub paths: BTreeMap<String, BlockNumber>,
    /// Data blocks of every file.
    pub data_blocks: BTreeMap<String, Vec<BlockNumber>>,
    /// Geometry of every area, keyed by its quota path ("/" for the root).
    pub areas: BTreeMap<String, AreaGeometry>,
    /// Contents of every file.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Absolute free extents of every area, as written to its allocator.
    pub free_extents: BTreeMap<String, Vec<(BlockNumber, u32)>>,
    /// Allocator header of every area.
    pub allocators: BTreeMap<String, BlockNumber>,
    /// Extent node chain of every area, in chain order.
    pub extent_nodes: BTreeMap<String, Vec<BlockNumber>>,
    /// First block of both shadow directories of every area.
    pub shadow_directories: BTreeMap<String, [BlockNumber; 2]>,
}

impl BuiltImage {
    /// Blocks owned by `path`: its first block plus, for files, the data.
    #[must_use]
    pub fn blocks_of(&self, path: &str) -> BTreeSet<BlockNumber> {
        self.paths
            .get(path)
            .into_iter()
            .copied()
            .chain(self.data_blocks.get(path).into_iter().flatten().copied())
            .collect()
    }

    /// Total bytes written.
    #[must_use]
    pub fn bytes_count(&self) -> u64 {
        self.blocks
            .values()
            .map(|params| u64::from(params.data_size))
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    spec: ImageSpec,
}

struct Cursor {
    geometry: AreaGeometry,
    next: u32,
    path: String,
}

impl Cursor {
    fn alloc(&mut self, count: u32) -> Result<u32> {
        let relative = self.next;
        let end = relative
            .checked_add(count)
            .filter(|end| *end <= self.geometry.blocks_count)
            .with_context(|| {
                format!(
                    "area {} is full: need {count} block(s) at {relative:#x} of {:#x}",
                    self.path, self.geometry.blocks_count
                )
            })?;
        self.next = end;
        Ok(relative)
    }
}

struct Writer<'a> {
    dev: &'a dyn BlocksDevice,
    image: BuiltImage,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(spec: ImageSpec) -> Self {
        Self { spec }
    }

    /// Write the image to `dev`, which must hold at least
    /// `spec.blocks_count` blocks.
    pub fn build(&self, dev: &dyn BlocksDevice) -> Result<BuiltImage> {
        ensure!(
            dev.blocks_count() >= self.spec.blocks_count,
            "device holds {:#x} blocks, image needs {:#x}",
            dev.blocks_count(),
            self.spec.blocks_count
        );
        ensure!(
            self.spec.transaction_blocks > 0,
            "transaction areas must not be empty"
        );

        let mut writer = Writer {
            dev,
            image: BuiltImage::default(),
        };
        let geometry = AreaGeometry::new(BlockNumber(0), self.spec.blocks_count);
        writer.build_area(
            geometry,
            "/",
            &self.spec.entries,
            &self.spec.shadow_entries,
            Some(self.spec.transaction_blocks),
        )?;
        dev.sync()?;
        debug!(
            blocks = writer.image.blocks.len(),
            bytes = writer.image.bytes_count(),
            "built image"
        );
        Ok(writer.image)
    }
}

impl Writer<'_> {
    fn write(
        &mut self,
        block: BlockNumber,
        params: BlockParams,
        data: &[u8],
        hash: HashUpdate,
    ) -> Result<()> {
        self.dev
            .write_block(block, &params, data, hash)
            .with_context(|| format!("failed to write block {block}"))?;
        let previous = self.image.blocks.insert(block, params);
        ensure!(previous.is_none(), "block {block} written twice");
        Ok(())
    }

    fn write_metadata(&mut self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.write(block, BlockParams::metadata(block), data, HashUpdate::Recalculate)
    }

    /// Lay out one area. `transaction_blocks` is set for the root area only.
    fn build_area(
        &mut self,
        geometry: AreaGeometry,
        path: &str,
        entries: &[NodeSpec],
        shadow_entries: &[NodeSpec],
        transaction_blocks: Option<u32>,
    ) -> Result<AreaHeader> {
        let mut cursor = Cursor {
            geometry,
            next: 1,
            path: path.to_owned(),
        };
        self.image.areas.insert(path.to_owned(), geometry);

        let mut transactions = Vec::new();
        if let Some(blocks) = transaction_blocks {
            for sequence in 0..TRANSACTION_AREAS {
                let relative = cursor.alloc(blocks)?;
                let area = AreaGeometry::new(geometry.to_absolute(relative), blocks);
                let header = TransactionAreaHeader {
                    blocks_count: blocks,
                    sequence: u32::try_from(sequence)?,
                };
                self.write(
                    area.base,
                    BlockParams::transaction_header(area.base),
                    &header.encode()?,
                    HashUpdate::Recalculate,
                )?;
                transactions.push(area);
            }
        }

        let allocator = cursor.alloc(1)?;
        let shadow_directory_1 = if shadow_entries.is_empty() {
            self.empty_dir(&mut cursor)?
        } else {
            let shadow_path = child_path(path, ".shadow_dir_1");
            self.build_dir(&mut cursor, &shadow_path, shadow_entries)?
        };
        let shadow_directory_2 = self.empty_dir(&mut cursor)?;
        self.image.shadow_directories.insert(
            path.to_owned(),
            [
                geometry.to_absolute(shadow_directory_1),
                geometry.to_absolute(shadow_directory_2),
            ],
        );

        let root_directory = self.build_dir(&mut cursor, path, entries)?;
        let area_header = AreaHeader {
            blocks_count: geometry.blocks_count,
            allocator,
            root_directory,
            shadow_directory_1,
            shadow_directory_2,
        };
        self.build_allocator(&mut cursor, allocator)?;

        let header_block = match transactions.as_slice() {
            [first, second] => DeviceHeader {
                version: WFS_VERSION,
                blocks_count: geometry.blocks_count,
                root_area: area_header,
                transactions: [*first, *second],
            }
            .encode()?,
            [] => area_header.encode()?,
            _ => bail!("unexpected transaction area count"),
        };
        self.write_metadata(geometry.base, &header_block)?;
        Ok(area_header)
    }

    fn empty_dir(&mut self, cursor: &mut Cursor) -> Result<u32> {
        let relative = cursor.alloc(1)?;
        self.write_metadata(
            cursor.geometry.to_absolute(relative),
            &DirectoryBlock::default().encode()?,
        )?;
        Ok(relative)
    }

    fn build_allocator(&mut self, cursor: &mut Cursor, allocator: u32) -> Result<()> {
        let available = cursor.geometry.blocks_count - cursor.next;
        let per_node = u32::try_from(MAX_NODE_EXTENTS)?;
        let mut nodes = 0_u32;
        loop {
            let free = available.saturating_sub(nodes);
            let needed = free.div_ceil(FREE_EXTENT_BLOCKS).div_ceil(per_node);
            if needed <= nodes {
                break;
            }
            nodes = needed;
        }
        let first_node = cursor.alloc(nodes)?;
        let free_start = cursor.next;
        let free = cursor.geometry.blocks_count - free_start;

        let extents: Vec<NodeExtent> = (free_start..cursor.geometry.blocks_count)
            .step_by(FREE_EXTENT_BLOCKS as usize)
            .map(|block| NodeExtent {
                block,
                count: FREE_EXTENT_BLOCKS.min(cursor.geometry.blocks_count - block),
            })
            .collect();
        self.image.free_extents.insert(
            cursor.path.clone(),
            extents
                .iter()
                .map(|extent| (cursor.geometry.to_absolute(extent.block), extent.count))
                .collect(),
        );

        let mut chunks = extents.chunks(MAX_NODE_EXTENTS);
        let mut node_blocks = Vec::new();
        for index in 0..nodes {
            let relative = first_node + index;
            let next = if index + 1 < nodes { relative + 1 } else { 0 };
            let node = ExtentNode {
                next,
                extents: chunks.next().map(<[NodeExtent]>::to_vec).unwrap_or_default(),
            };
            let absolute = cursor.geometry.to_absolute(relative);
            self.write_metadata(absolute, &node.encode()?)?;
            node_blocks.push(absolute);
        }
        self.image
            .extent_nodes
            .insert(cursor.path.clone(), node_blocks);

        let header = AllocatorHeader {
            free_blocks_count: free,
            free_metadata_blocks_count: free.min(LARGE_BLOCK_BLOCKS),
            free_metadata_block: if free > 0 { free_start } else { 0 },
            first_node: if nodes > 0 { first_node } else { 0 },
        };
        let absolute = cursor.geometry.to_absolute(allocator);
        self.image.allocators.insert(cursor.path.clone(), absolute);
        self.write_metadata(absolute, &header.encode()?)
    }

    /// Returns the area-relative first block of the directory.
    fn build_dir(&mut self, cursor: &mut Cursor, path: &str, entries: &[NodeSpec]) -> Result<u32> {
        let mut names = BTreeSet::new();
        for entry in entries {
            let name = entry.name();
            ensure!(
                !name.is_empty() && name.len() <= MAX_NAME_LEN && !name.contains('/'),
                "invalid entry name {name:?} in {path}"
            );
            ensure!(names.insert(name), "duplicate entry {name:?} in {path}");
        }

        // Pack entries into blocks before allocating children so the
        // directory's blocks come first.
        let mut groups: Vec<Vec<&NodeSpec>> = vec![Vec::new()];
        let mut used = 0_usize;
        for entry in entries {
            let len = DirectoryEntry::encoded_len(entry.name());
            if used + len > DIRECTORY_PAYLOAD {
                groups.push(Vec::new());
                used = 0;
            }
            used += len;
            if let Some(group) = groups.last_mut() {
                group.push(entry);
            }
        }
        let first = cursor.alloc(u32::try_from(groups.len())?)?;

        for (index, group) in groups.iter().enumerate() {
            let mut dir_block = DirectoryBlock {
                next: if index + 1 < groups.len() {
                    first + u32::try_from(index + 1)?
                } else {
                    0
                },
                entries: Vec::with_capacity(group.len()),
            };
            for entry in group {
                let child = child_path(path, entry.name());
                let (kind, block) = self.build_entry(cursor, &child, entry)?;
                dir_block.entries.push(DirectoryEntry {
                    name: entry.name().to_owned(),
                    kind,
                    block,
                });
            }
            let absolute = cursor.geometry.to_absolute(first + u32::try_from(index)?);
            self.write_metadata(absolute, &dir_block.encode()?)?;
        }

        self.image
            .paths
            .insert(path.to_owned(), cursor.geometry.to_absolute(first));
        Ok(first)
    }

    fn build_entry(
        &mut self,
        cursor: &mut Cursor,
        path: &str,
        entry: &NodeSpec,
    ) -> Result<(EntryKind, u32)> {
        match entry {
            NodeSpec::File {
                size, seed, text, ..
            } => {
                let contents = text
                    .as_ref()
                    .map_or_else(|| pattern_bytes(*size, *seed), |text| text.as_bytes().to_vec());
                let block = self.build_file(cursor, path, contents)?;
                Ok((EntryKind::File, block))
            }
            NodeSpec::Dir { entries, .. } => {
                let block = self.build_dir(cursor, path, entries)?;
                Ok((EntryKind::Directory, block))
            }
            NodeSpec::Quota {
                blocks,
                entries,
                shadow,
                ..
            } => {
                let relative = cursor.alloc(*blocks)?;
                let geometry = AreaGeometry::new(cursor.geometry.to_absolute(relative), *blocks);
                self.build_area(geometry, path, entries, shadow, None)?;
                Ok((EntryKind::Quota, relative))
            }
        }
    }

    fn build_file(&mut self, cursor: &mut Cursor, path: &str, contents: Vec<u8>) -> Result<u32> {
        let header_block = cursor.alloc(1)?;
        let mut extents = Vec::new();
        let mut data_blocks = Vec::new();
        for chunk in contents.chunks(LARGE_BLOCK_SIZE as usize) {
            let data_size = round_up_to_sector(u32::try_from(chunk.len())?);
            let size_in_blocks = blocks_for_bytes(data_size);
            let relative = cursor.alloc(size_in_blocks)?;
            let absolute = cursor.geometry.to_absolute(relative);

            let mut padded = chunk.to_vec();
            padded.resize(data_size as usize, 0);
            let hash = block_hash(&padded);
            self.write(
                absolute,
                BlockParams::data(absolute, size_in_blocks, data_size),
                &padded,
                HashUpdate::Keep,
            )?;
            extents.push(DataExtent {
                block: relative,
                size_in_blocks,
                data_size,
                hash,
            });
            data_blocks.push(absolute);
        }
        ensure!(
            extents.len() <= MAX_FILE_EXTENTS,
            "file {path} needs {} extents, at most {MAX_FILE_EXTENTS} fit",
            extents.len()
        );

        let header = FileHeader {
            size: contents.len() as u64,
            extents,
        };
        let absolute = cursor.geometry.to_absolute(header_block);
        self.write_metadata(absolute, &header.encode()?)?;
        self.image.paths.insert(path.to_owned(), absolute);
        self.image.data_blocks.insert(path.to_owned(), data_blocks);
        self.image.files.insert(path.to_owned(), contents);
        Ok(header_block)
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryByteDevice;
    use wfs_block::{EncryptedBlocksDevice, HashCheck};
    use wfs_crypto::DeviceKey;

    fn sample() -> ImageSpec {
        ImageSpec::new(
            256,
            vec![
                NodeSpec::text("readme.txt", "hello"),
                NodeSpec::dir("save", vec![NodeSpec::pattern("big.bin", 40_000, 1)]),
                NodeSpec::quota("usr", 64, vec![NodeSpec::text("a", "b")]),
            ],
        )
    }

    #[test]
    fn every_written_block_reads_back_with_its_params() {
        let memory = MemoryByteDevice::with_blocks(256);
        let dev = EncryptedBlocksDevice::new(memory, Some(DeviceKey::new([5; 16])))
            .expect("device");
        let built = ImageBuilder::new(sample()).build(&dev).expect("build");

        for (block, params) in &built.blocks {
            dev.read_block(*block, params, HashCheck::Skip)
                .expect("readable");
        }
        assert!(built.blocks.contains_key(&BlockNumber(0)));
        assert_eq!(built.areas["/"].blocks_count, 256);
        assert_eq!(built.areas["/usr"].blocks_count, 64);
        assert_eq!(built.files["/save/big.bin"].len(), 40_000);
        // 32 KiB + 7232 bytes rounded up to 7680.
        assert_eq!(built.data_blocks["/save/big.bin"].len(), 2);
    }

    #[test]
    fn transaction_headers_are_clear_text() {
        let built = crate::build_memory_image(&sample(), Some(DeviceKey::new([1; 16])))
            .expect("build")
            .1;
        let clear: Vec<_> = built
            .blocks
            .iter()
            .filter(|(_, params)| !params.encrypted)
            .map(|(block, _)| *block)
            .collect();
        assert_eq!(clear, vec![BlockNumber(1), BlockNumber(5)]);
    }

    #[test]
    fn shadow_contents_and_allocator_blocks_are_tracked() {
        let spec = ImageSpec::new(
            256,
            vec![NodeSpec::quota("usr", 96, Vec::new())
                .with_shadow(vec![NodeSpec::text("pending", "p")])],
        );
        let built = crate::build_memory_image(&spec, None).expect("build").1;

        let [first, second] = built.shadow_directories["/usr"];
        assert_eq!(built.paths["/usr/.shadow_dir_1"], first);
        assert_eq!(built.files["/usr/.shadow_dir_1/pending"], b"p");
        assert!(built.blocks.contains_key(&second));
        assert!(!built.paths.contains_key("/.shadow_dir_1"));

        for area in ["/", "/usr"] {
            assert!(built.blocks.contains_key(&built.allocators[area]));
            assert!(!built.extent_nodes[area].is_empty());
        }
        // Allocator and first shadow directory follow the area header.
        let base = built.areas["/usr"].base.0;
        assert_eq!(built.allocators["/usr"], BlockNumber(base + 1));
        assert_eq!(first, BlockNumber(base + 2));
    }

    #[test]
    fn oversized_content_is_rejected() {
        let spec = ImageSpec::new(16, vec![NodeSpec::pattern("huge", 1 << 20, 0)]);
        let err = crate::build_memory_image(&spec, None).expect_err("too big");
        assert!(format!("{err:#}").contains("is full"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let spec = ImageSpec::new(
            64,
            vec![NodeSpec::text("a", "1"), NodeSpec::text("a", "2")],
        );
        assert!(crate::build_memory_image(&spec, None).is_err());
    }

    #[test]
    fn spec_parses_from_json() {
        let spec: ImageSpec = serde_json::from_str(
            r#"{
                "blocks_count": 128,
                "entries": [
                    {"type": "file", "name": "a.txt", "text": "hi"},
                    {"type": "quota", "name": "q", "blocks": 32, "entries": [
                        {"type": "dir", "name": "d"}
                    ]}
                ]
            }"#,
        )
        .expect("json");
        assert_eq!(spec.transaction_blocks, 4);
        assert_eq!(spec.entries[1].name(), "q");
    }

    #[test]
    fn pattern_is_deterministic() {
        assert_eq!(pattern_bytes(100, 3), pattern_bytes(100, 3));
        assert_ne!(pattern_bytes(100, 3), pattern_bytes(100, 4));
    }
}
