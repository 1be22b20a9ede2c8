#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use wfs_block::{
    BlockParams, BlocksDevice, EncryptedBlocksDevice, FileByteDevice, HashCheck, HashUpdate,
};
use wfs_core::{Directory, Entry, WfsDevice, child_path, dump_allocators};
use wfs_crypto::{DeviceKey, KeyScheme, KeySource};
use wfs_error::WfsError;
use wfs_harness::{
    BuiltImage, ImageBuilder, ImageSpec, MemoryByteDevice, NodeSpec, build_memory_image,
    write_key_files,
};
use wfs_ondisk::ExtentNode;
use wfs_reencrypt::{
    ExploreTarget, NoExploreProgress, NoTranscodeProgress, ReencryptJob, TranscodeProgress,
    discover, reencrypt, transcode_device,
};
use wfs_types::{BLOCK_SIZE, BlockNumber};

const SOURCE_KEY: [u8; 16] = [0xA5; 16];
const DEST_KEY: [u8; 16] = [0x0F; 16];

fn spec() -> ImageSpec {
    ImageSpec::new(
        384,
        vec![
            NodeSpec::text("hello.txt", "hello, world\n"),
            NodeSpec::dir(
                "data",
                vec![
                    NodeSpec::pattern("a.bin", 80_000, 1),
                    NodeSpec::pattern("b.bin", 3000, 2),
                    NodeSpec::dir("nested", vec![NodeSpec::pattern("c.bin", 512, 3)]),
                ],
            ),
            NodeSpec::quota(
                "quota",
                96,
                vec![
                    NodeSpec::text("inside.txt", "inside"),
                    NodeSpec::quota("deeper", 32, vec![NodeSpec::text("leaf", "leaf")]),
                ],
            ),
        ],
    )
}

fn device(
    memory: &MemoryByteDevice,
    key: Option<[u8; 16]>,
) -> EncryptedBlocksDevice<MemoryByteDevice> {
    EncryptedBlocksDevice::new(memory.clone(), key.map(DeviceKey::new)).expect("device")
}

fn collect_files(dir: Directory<'_>, path: &str, out: &mut BTreeMap<String, Vec<u8>>) {
    for (name, entry) in dir {
        let child = child_path(path, &name);
        match entry.expect("entry resolves") {
            Entry::File(file) => {
                out.insert(child, file.read_all().expect("file data"));
            }
            Entry::Directory(sub) => collect_files(sub, &child, out),
        }
    }
}

fn read_tree(dev: &dyn BlocksDevice) -> BTreeMap<String, Vec<u8>> {
    let wfs = WfsDevice::open(dev).expect("mount");
    let mut files = BTreeMap::new();
    collect_files(wfs.root_directory().expect("root"), "/", &mut files);
    files
}

fn write_image_file(path: &Path, spec: &ImageSpec, key: Option<DeviceKey>) -> BuiltImage {
    let len = u64::from(spec.blocks_count) * u64::from(BLOCK_SIZE);
    let file = FileByteDevice::create(path, len).expect("create image");
    let dev = EncryptedBlocksDevice::new(file, key).expect("device");
    ImageBuilder::new(spec.clone()).build(&dev).expect("build")
}

fn open_image_file(path: &Path, key: Option<DeviceKey>) -> EncryptedBlocksDevice<FileByteDevice> {
    let file = FileByteDevice::open_read_only(path).expect("open image");
    EncryptedBlocksDevice::new(file, key).expect("device")
}

#[test]
fn transcoding_preserves_every_block_and_file() {
    let (memory, built) = build_memory_image(&spec(), Some(DeviceKey::new(SOURCE_KEY))).expect("build");
    let source = device(&memory, Some(SOURCE_KEY));
    let dest_memory = MemoryByteDevice::with_blocks(384);
    let destination = device(&dest_memory, Some(DEST_KEY));

    let (discovery, summary) = transcode_device(
        &source,
        &destination,
        &mut NoExploreProgress,
        &mut NoTranscodeProgress,
    )
    .expect("transcode");
    assert!(discovery.failures.is_empty());

    for descriptor in discovery.inventory.iter() {
        let block = descriptor.block_number;
        let params = descriptor.params;
        let before = source.read_block(block, &params, HashCheck::Skip).expect("source");
        let after = destination
            .read_block(block, &params, HashCheck::Skip)
            .expect("destination");
        assert_eq!(before, after, "block {block} changed");
        if params.encrypted {
            assert_ne!(memory.raw_block(block), dest_memory.raw_block(block));
        }
    }

    assert_eq!(read_tree(&destination), built.files);
    let wfs = WfsDevice::open(&destination).expect("mount destination");
    let dump = dump_allocators(&wfs).expect("dump");
    assert_eq!(dump.areas.len(), 3);
    assert!(dump.failures.is_empty());

    assert_eq!(summary.blocks, discovery.inventory.blocks_count());
    assert_eq!(summary.bytes, discovery.inventory.bytes_count());
    assert_eq!(summary.skipped_bad_blocks, 0);
}

#[test]
fn discovery_is_deterministic() {
    let (memory, _) = build_memory_image(&spec(), Some(DeviceKey::new(SOURCE_KEY))).expect("build");
    let source = device(&memory, Some(SOURCE_KEY));
    let first = discover(&source, &mut NoExploreProgress).expect("first");
    let second = discover(&source, &mut NoExploreProgress).expect("second");
    assert_eq!(first.inventory, second.inventory);
}

#[test]
fn damaged_entry_is_skipped_and_siblings_survive() {
    let (memory, built) = build_memory_image(&spec(), Some(DeviceKey::new(SOURCE_KEY))).expect("build");
    let header = built.paths["/data/a.bin"];
    memory.corrupt_block(header).expect("corrupt");
    let source = device(&memory, Some(SOURCE_KEY));

    let discovery = discover(&source, &mut NoExploreProgress).expect("discover");
    assert_eq!(discovery.failures.len(), 1);
    let failure = &discovery.failures[0];
    assert_eq!(failure.path, "/data/a.bin");
    assert_eq!(failure.target, ExploreTarget::Entry);
    assert!(failure.error.is_block_damage());

    let lost = built.blocks_of("/data/a.bin");
    let expected: BTreeSet<BlockNumber> = built
        .blocks
        .keys()
        .copied()
        .filter(|block| !lost.contains(block))
        .collect();
    let found: BTreeSet<BlockNumber> = discovery.inventory.blocks().keys().copied().collect();
    assert_eq!(found, expected);
    for sibling in ["/data/b.bin", "/data/nested/c.bin", "/quota/deeper/leaf"] {
        assert!(built.blocks_of(sibling).is_subset(&found), "{sibling} missing");
    }

    let bad: Vec<BlockNumber> = discovery.inventory.bad_blocks().map(|d| d.block_number).collect();
    assert_eq!(bad, vec![header]);
    assert!(bad.iter().all(|block| !found.contains(block)));

    let destination = device(&MemoryByteDevice::with_blocks(384), None);
    let summary = reencrypt(&discovery.inventory, &source, &destination, &mut NoTranscodeProgress)
        .expect("transcode");
    assert_eq!(summary.skipped_bad_blocks, 1);
    assert_eq!(summary.blocks, found.len());
}

#[test]
fn damaged_file_data_keeps_the_blocks_read_before_it() {
    let (memory, built) = build_memory_image(&spec(), Some(DeviceKey::new(SOURCE_KEY))).expect("build");
    let data = &built.data_blocks["/data/a.bin"];
    assert_eq!(data.len(), 3);
    memory.corrupt_block(data[1]).expect("corrupt");
    let source = device(&memory, Some(SOURCE_KEY));

    let discovery = discover(&source, &mut NoExploreProgress).expect("discover");
    assert_eq!(discovery.failures.len(), 1);
    assert_eq!(discovery.failures[0].target, ExploreTarget::FileData);
    assert!(discovery.inventory.get(built.paths["/data/a.bin"]).is_some());
    assert!(discovery.inventory.get(data[0]).is_some());
    assert!(discovery.inventory.get(data[1]).is_none());
    assert!(discovery.inventory.get(data[2]).is_none());
    assert_eq!(discovery.inventory.bad_blocks_count(), 1);
}

#[test]
fn damaged_transaction_area_does_not_stop_the_walk() {
    let (memory, built) = build_memory_image(&spec(), Some(DeviceKey::new(SOURCE_KEY))).expect("build");
    memory.corrupt_block(BlockNumber(1)).expect("corrupt");
    let source = device(&memory, Some(SOURCE_KEY));

    let discovery = discover(&source, &mut NoExploreProgress).expect("discover");
    let targets: Vec<ExploreTarget> = discovery.failures.iter().map(|f| f.target).collect();
    assert_eq!(targets, vec![ExploreTarget::TransactionsArea(0)]);
    assert_eq!(discovery.inventory.blocks_count(), built.blocks.len() - 1);
}

fn inventoried(discovery: &wfs_reencrypt::Discovery) -> BTreeSet<BlockNumber> {
    discovery.inventory.blocks().keys().copied().collect()
}

fn written_except(built: &BuiltImage, lost: &BTreeSet<BlockNumber>) -> BTreeSet<BlockNumber> {
    built
        .blocks
        .keys()
        .copied()
        .filter(|block| !lost.contains(block))
        .collect()
}

#[test]
fn unordered_extents_do_not_hide_later_extent_nodes() {
    let spec = ImageSpec::new(9000, vec![NodeSpec::text("a.txt", "a")]);
    let (memory, built) = build_memory_image(&spec, None).expect("build");
    let nodes = built.extent_nodes["/"].clone();
    assert!(nodes.len() >= 2, "{nodes:?}");

    let dev = device(&memory, None);
    let params = BlockParams::metadata(nodes[0]);
    let buf = dev
        .read_block(nodes[0], &params, HashCheck::Embedded)
        .expect("node");
    let mut node = ExtentNode::parse(buf.as_slice()).expect("parse");
    node.extents.swap(0, 1);
    dev.write_block(
        nodes[0],
        &params,
        &node.encode().expect("encode"),
        HashUpdate::Recalculate,
    )
    .expect("rewrite");

    let discovery = discover(&dev, &mut NoExploreProgress).expect("discover");
    assert!(discovery.failures.is_empty(), "{:?}", discovery.failures);
    let found = inventoried(&discovery);
    for node in &nodes {
        assert!(found.contains(node), "extent node {node} not inventoried");
    }
    assert_eq!(found, written_except(&built, &BTreeSet::new()));

    // The allocator report still rejects the swapped extents.
    let wfs = WfsDevice::open(&dev).expect("open");
    let dump = dump_allocators(&wfs).expect("dump");
    assert_eq!(dump.failures.len(), 1);
    assert_eq!(dump.failures[0].path, "/");
}

#[test]
fn damaged_extent_node_is_reported_and_siblings_survive() {
    let (memory, built) = build_memory_image(&spec(), Some(DeviceKey::new(SOURCE_KEY))).expect("build");
    let nodes = &built.extent_nodes["/quota"];
    memory.corrupt_block(nodes[0]).expect("corrupt");
    let source = device(&memory, Some(SOURCE_KEY));

    let discovery = discover(&source, &mut NoExploreProgress).expect("discover");
    assert_eq!(discovery.failures.len(), 1);
    let failure = &discovery.failures[0];
    assert_eq!(failure.path, "/quota");
    assert_eq!(failure.target, ExploreTarget::FreeBlocksAllocator);
    assert!(failure.error.is_block_damage());
    assert!(failure.to_string().starts_with("Failed to explore /quota free blocks allocator ("));

    // The chain ends at the damaged node.
    let lost: BTreeSet<BlockNumber> = nodes.iter().copied().collect();
    assert_eq!(inventoried(&discovery), written_except(&built, &lost));
    let bad: Vec<BlockNumber> = discovery.inventory.bad_blocks().map(|d| d.block_number).collect();
    assert_eq!(bad, vec![nodes[0]]);
}

#[test]
fn damaged_allocator_header_skips_only_its_allocator() {
    let (memory, built) = build_memory_image(&spec(), Some(DeviceKey::new(SOURCE_KEY))).expect("build");
    let allocator = built.allocators["/quota/deeper"];
    memory.corrupt_block(allocator).expect("corrupt");
    let source = device(&memory, Some(SOURCE_KEY));

    let discovery = discover(&source, &mut NoExploreProgress).expect("discover");
    let targets: Vec<(&str, ExploreTarget)> = discovery
        .failures
        .iter()
        .map(|f| (f.path.as_str(), f.target))
        .collect();
    assert_eq!(targets, vec![("/quota/deeper", ExploreTarget::FreeBlocksAllocator)]);

    let mut lost: BTreeSet<BlockNumber> =
        built.extent_nodes["/quota/deeper"].iter().copied().collect();
    lost.insert(allocator);
    let found = inventoried(&discovery);
    assert_eq!(found, written_except(&built, &lost));
    for shadow in built.shadow_directories["/quota/deeper"] {
        assert!(found.contains(&shadow));
    }
    assert!(built.blocks_of("/quota/deeper/leaf").is_subset(&found));
}

#[test]
fn damaged_shadow_directory_is_reported_and_the_area_survives() {
    let (memory, built) = build_memory_image(&spec(), Some(DeviceKey::new(SOURCE_KEY))).expect("build");
    let [first, second] = built.shadow_directories["/quota"];
    memory.corrupt_block(second).expect("corrupt");
    let source = device(&memory, Some(SOURCE_KEY));

    let discovery = discover(&source, &mut NoExploreProgress).expect("discover");
    assert_eq!(discovery.failures.len(), 1);
    let failure = &discovery.failures[0];
    assert_eq!(failure.target, ExploreTarget::ShadowDirectory(2));
    assert!(failure.to_string().starts_with("Failed to explore /quota shadow dir 2 ("));

    let found = inventoried(&discovery);
    assert_eq!(found, written_except(&built, &BTreeSet::from([second])));
    assert!(found.contains(&first));
    assert!(built.blocks_of("/quota/inside.txt").is_subset(&found));
}

#[test]
fn quotas_inside_shadow_content_are_walked_as_plain_directories() {
    let spec = ImageSpec::new(
        512,
        vec![
            NodeSpec::text("hello.txt", "hello"),
            NodeSpec::quota("quota", 192, vec![NodeSpec::text("inside.txt", "inside")]).with_shadow(
                vec![
                    NodeSpec::text("pending.txt", "pending"),
                    NodeSpec::quota("staged", 48, vec![NodeSpec::text("leaf", "leaf")]),
                ],
            ),
        ],
    );
    let (memory, built) = build_memory_image(&spec, Some(DeviceKey::new(SOURCE_KEY))).expect("build");
    let source = device(&memory, Some(SOURCE_KEY));

    let discovery = discover(&source, &mut NoExploreProgress).expect("discover");
    assert!(discovery.failures.is_empty(), "{:?}", discovery.failures);
    let found = inventoried(&discovery);

    let staged = "/quota/.shadow_dir_1/staged";
    assert!(found.contains(&built.areas[staged].base));
    for path in ["/quota/.shadow_dir_1", "/quota/.shadow_dir_1/pending.txt", staged] {
        assert!(built.blocks_of(path).is_subset(&found), "{path} missing");
    }
    assert!(built.blocks_of(&format!("{staged}/leaf")).is_subset(&found));

    // Nothing below the staged quota's boundary is treated as an area.
    let mut skipped: BTreeSet<BlockNumber> = built.extent_nodes[staged].iter().copied().collect();
    skipped.insert(built.allocators[staged]);
    skipped.extend(built.shadow_directories[staged]);
    assert!(skipped.iter().all(|block| !found.contains(block)));
    assert_eq!(found, written_except(&built, &skipped));
}

#[test]
fn transcode_totals_match_the_inventory() {
    let (memory, built) = build_memory_image(&spec(), None).expect("build");
    let source = device(&memory, None);
    let destination = device(&MemoryByteDevice::with_blocks(384), Some(DEST_KEY));
    let discovery = discover(&source, &mut NoExploreProgress).expect("discover");

    let mut last = None;
    let mut observer = |progress: &TranscodeProgress| last = Some(*progress);
    let summary =
        reencrypt(&discovery.inventory, &source, &destination, &mut observer).expect("transcode");

    let last = last.expect("progress reported");
    assert_eq!(last.blocks_done, last.blocks_total);
    assert_eq!(last.bytes_done, built.bytes_count());
    assert!((last.percent() - 100.0).abs() < 1e-9);
    assert_eq!(summary.blocks, built.blocks.len());
    assert_eq!(summary.bytes, built.bytes_count());
}

#[test]
fn usb_to_plain_to_mlc_through_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let keys = write_key_files(dir.path(), 7).expect("keys");
    let usb = keys.source(KeyScheme::Usb);
    let mlc = keys.source(KeyScheme::Mlc);
    let usb_key = usb.load().expect("usb key");
    let mlc_key = mlc.load().expect("mlc key");

    let input = dir.path().join("usb.img");
    let built = write_image_file(&input, &spec(), usb_key);

    let plain = dir.path().join("plain.img");
    let report = ReencryptJob::new(&input, usb.clone(), Some(plain.clone()), KeySource::plain())
        .expect("job")
        .run(&mut NoExploreProgress, &mut NoTranscodeProgress)
        .expect("usb -> plain");
    assert!(!report.in_place);
    assert_eq!(report.summary.blocks, built.blocks.len());
    assert_eq!(
        std::fs::metadata(&plain).expect("output").len(),
        std::fs::metadata(&input).expect("input").len()
    );
    assert_eq!(read_tree(&open_image_file(&plain, None)), built.files);
    // The header is readable as clear text.
    let raw = std::fs::read(&plain).expect("read plain");
    assert_eq!(&raw[24..28], &wfs_types::WFS_VERSION.to_be_bytes());

    let report = ReencryptJob::new(&plain, KeySource::plain(), None, mlc)
        .expect("job")
        .run(&mut NoExploreProgress, &mut NoTranscodeProgress)
        .expect("plain -> mlc in place");
    assert!(report.in_place);
    assert_eq!(read_tree(&open_image_file(&plain, mlc_key)), built.files);

    let err = WfsDevice::open(&open_image_file(&plain, None)).expect_err("no longer plain");
    assert!(err.is_wrong_key() || err.is_block_damage());
}

#[test]
fn wrong_input_key_short_circuits_the_job() {
    let dir = tempfile::tempdir().expect("tempdir");
    let keys = write_key_files(dir.path(), 1).expect("keys");
    let input = dir.path().join("usb.img");
    write_image_file(&input, &spec(), keys.source(KeyScheme::Usb).load().expect("key"));
    let before = std::fs::read(&input).expect("read input");

    let output = dir.path().join("out.img");
    let err = ReencryptJob::new(
        &input,
        keys.source(KeyScheme::Mlc),
        Some(output.clone()),
        KeySource::plain(),
    )
    .expect("job")
    .run(&mut NoExploreProgress, &mut NoTranscodeProgress)
    .expect_err("wrong key");
    assert!(matches!(err, WfsError::InvalidWfsVersion { .. }));
    assert!(!output.exists());

    let err = ReencryptJob::new(&input, KeySource::plain(), None, KeySource::plain())
        .expect("job")
        .run(&mut NoExploreProgress, &mut NoTranscodeProgress)
        .expect_err("wrong key in place");
    assert!(err.is_wrong_key());
    assert_eq!(std::fs::read(&input).expect("read input"), before);
}

#[test]
fn incomplete_key_arguments_touch_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("input.img");
    write_image_file(&input, &spec(), None);
    let output = dir.path().join("out.img");

    let usb_without_files = KeySource {
        scheme: KeyScheme::Usb,
        otp: None,
        seeprom: None,
    };
    let err = ReencryptJob::new(&input, KeySource::plain(), Some(output.clone()), usb_without_files)
        .expect_err("rejected");
    assert!(matches!(err, WfsError::Config(_)));
    assert!(!output.exists());
}
