#![forbid(unsafe_code)]
//! Test harness for the WFS toolset.
//!
//! - [`MemoryByteDevice`]: a shared in-memory image with fault injection.
//! - [`image`]: JSON-described synthetic images and the builder that lays
//!   them out on any [`BlocksDevice`](wfs_block::BlocksDevice).
//! - Key-file fixtures so tests can exercise the `usb` and `mlc` schemes
//!   end to end.

pub mod image;

pub use image::{BuiltImage, ImageBuilder, ImageSpec, NodeSpec};

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use wfs_block::{ByteDevice, EncryptedBlocksDevice};
use wfs_crypto::keys::{OTP_SIZE, SEEPROM_SIZE};
use wfs_crypto::{DeviceKey, KeyScheme, KeySource};
use wfs_error::WfsError;
use wfs_types::{BLOCK_SIZE, BlockNumber};

/// In-memory byte device. Clones share the same bytes.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    reads: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    /// A zeroed device of `blocks` basic blocks.
    #[must_use]
    pub fn with_blocks(blocks: u32) -> Self {
        Self::new(blocks as usize * BLOCK_SIZE as usize)
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
            reads: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Raw (still encrypted) bytes of one basic block.
    #[must_use]
    pub fn raw_block(&self, block: BlockNumber) -> Vec<u8> {
        let start = usize::try_from(block.byte_offset()).unwrap_or(usize::MAX);
        let bytes = self.bytes.lock();
        bytes
            .get(start..start.saturating_add(BLOCK_SIZE as usize))
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    /// Flip one byte inside `block` so that it fails its hash check.
    pub fn corrupt_block(&self, block: BlockNumber) -> Result<()> {
        let offset = usize::try_from(block.byte_offset())? + 100;
        let mut bytes = self.bytes.lock();
        let Some(byte) = bytes.get_mut(offset) else {
            bail!("block {block} is outside the device");
        };
        *byte ^= 0xFF;
        Ok(())
    }

    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn range(&self, offset: u64, len: usize) -> wfs_error::Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset)
            .map_err(|_| WfsError::Format(format!("offset {offset} overflows usize")))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.bytes.lock().len())
            .ok_or_else(|| {
                WfsError::Format(format!("access out of bounds: offset={offset} len={len}"))
            })?;
        Ok(start..end)
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> wfs_error::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes.lock()[range]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> wfs_error::Result<()> {
        let range = self.range(offset, buf.len())?;
        self.bytes.lock()[range].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync(&self) -> wfs_error::Result<()> {
        Ok(())
    }
}

/// Build an image from `spec` on a fresh in-memory device.
pub fn build_memory_image(
    spec: &ImageSpec,
    key: Option<DeviceKey>,
) -> Result<(MemoryByteDevice, BuiltImage)> {
    let memory = MemoryByteDevice::with_blocks(spec.blocks_count);
    let dev = EncryptedBlocksDevice::new(memory.clone(), key)?;
    let built = ImageBuilder::new(spec.clone()).build(&dev)?;
    Ok((memory, built))
}

/// Deterministic OTP contents for tests.
#[must_use]
pub fn test_otp_bytes(seed: u8) -> Vec<u8> {
    (0..OTP_SIZE)
        .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
        .collect()
}

/// Deterministic SEEPROM contents for tests.
#[must_use]
pub fn test_seeprom_bytes(seed: u8) -> Vec<u8> {
    (0..SEEPROM_SIZE)
        .map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed))
        .collect()
}

/// Key files written by [`write_key_files`].
#[derive(Debug, Clone)]
pub struct KeyFiles {
    pub otp: PathBuf,
    pub seeprom: PathBuf,
}

impl KeyFiles {
    #[must_use]
    pub fn source(&self, scheme: KeyScheme) -> KeySource {
        KeySource {
            scheme,
            otp: scheme.needs_otp().then(|| self.otp.clone()),
            seeprom: scheme.needs_seeprom().then(|| self.seeprom.clone()),
        }
    }
}

/// Write an OTP/SEEPROM pair into `dir`.
pub fn write_key_files(dir: &Path, seed: u8) -> Result<KeyFiles> {
    let otp = dir.join(format!("otp-{seed}.bin"));
    let seeprom = dir.join(format!("seeprom-{seed}.bin"));
    fs::write(&otp, test_otp_bytes(seed))
        .with_context(|| format!("failed to write {}", otp.display()))?;
    fs::write(&seeprom, test_seeprom_bytes(seed))
        .with_context(|| format!("failed to write {}", seeprom.display()))?;
    Ok(KeyFiles { otp, seeprom })
}

/// Load an image description from a JSON file.
pub fn load_image_spec(path: &Path) -> Result<ImageSpec> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read image spec {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid image spec json {}", path.display()))
}

/// Path of a fixture under `conformance/fixtures` at the workspace root.
#[must_use]
pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../conformance/fixtures")
        .join(name)
}

/// Decode a 16-byte key given as 32 hex digits.
pub fn parse_key_hex(raw: &str) -> Result<DeviceKey> {
    let bytes = hex::decode(raw.trim()).context("key is not valid hex")?;
    Ok(DeviceKey::from_slice(&bytes)?)
}
