#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Two levels:
//!
//! - [`ByteDevice`]: fixed-offset byte I/O over an image file (or memory).
//! - [`BlocksDevice`]: block-addressed reads and writes that decrypt,
//!   encrypt and verify integrity hashes. [`EncryptedBlocksDevice`] is the
//!   concrete implementation; wrappers (such as a recording proxy) implement
//!   the same trait and delegate.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;
use wfs_crypto::cipher::CIPHER_BLOCK_SIZE;
use wfs_crypto::{BlockCipher, DeviceKey, block_hash, seal_embedded_hash, verify_embedded_hash};
use wfs_error::{Result, WfsError};
use wfs_types::{BLOCK_SIZE, BlockHash, BlockNumber};

/// Owned block buffer.
///
/// Invariant: length == the `data_size` the block was read with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn checked_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| WfsError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| WfsError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(WfsError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Clones share the same open file, so a source and a destination
/// [`EncryptedBlocksDevice`] can sit on one image for in-place re-encryption.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    /// Create (or truncate) an image of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Self::from_file(file, true)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(WfsError::ReadOnly);
        }
        checked_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Parameters a block is read or written with.
///
/// These four values are everything needed to reproduce the exact
/// decryption of a block, which is why discovery records them per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockParams {
    /// Basic blocks reserved for this block on the device.
    pub size_in_blocks: u32,
    /// Bytes actually stored (and encrypted).
    pub data_size: u32,
    pub iv: u32,
    pub encrypted: bool,
}

impl BlockParams {
    /// A single basic block of metadata.
    #[must_use]
    pub fn metadata(block: BlockNumber) -> Self {
        Self {
            size_in_blocks: 1,
            data_size: BLOCK_SIZE,
            iv: block.sector_address(),
            encrypted: true,
        }
    }

    /// A file data block spanning `size_in_blocks` basic blocks.
    #[must_use]
    pub fn data(block: BlockNumber, size_in_blocks: u32, data_size: u32) -> Self {
        Self {
            size_in_blocks,
            data_size,
            iv: block.sector_address(),
            encrypted: true,
        }
    }

    /// The clear-text first block of a transaction area.
    #[must_use]
    pub fn transaction_header(block: BlockNumber) -> Self {
        Self {
            encrypted: false,
            ..Self::metadata(block)
        }
    }

    fn data_len(&self) -> usize {
        // u32 always fits usize on supported targets.
        self.data_size as usize
    }
}

/// Whether and how to verify a block's integrity hash on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCheck<'a> {
    /// No verification.
    Skip,
    /// Metadata block carrying its own hash in the first 20 bytes.
    Embedded,
    /// Data block whose hash is stored by its owner.
    Expected(&'a BlockHash),
}

impl HashCheck<'_> {
    #[must_use]
    pub fn is_checked(&self) -> bool {
        !matches!(self, Self::Skip)
    }
}

/// Whether to refresh a metadata block's embedded hash on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashUpdate {
    /// Write bytes as given; any embedded hash is carried verbatim.
    Keep,
    /// Recompute the embedded hash before encrypting.
    Recalculate,
}

/// Block-addressed I/O interface.
pub trait BlocksDevice: Send + Sync {
    /// Read `params.data_size` bytes at `block`, decrypting and verifying as requested.
    fn read_block(
        &self,
        block: BlockNumber,
        params: &BlockParams,
        hash: HashCheck<'_>,
    ) -> Result<BlockBuf>;

    /// Write `data` at `block`. `data.len()` MUST equal `params.data_size`.
    fn write_block(
        &self,
        block: BlockNumber,
        params: &BlockParams,
        data: &[u8],
        hash: HashUpdate,
    ) -> Result<()>;

    /// Total number of basic blocks.
    fn blocks_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// [`BlocksDevice`] over a [`ByteDevice`] with an optional AES key.
///
/// Without a key every block is stored in clear, whatever its `encrypted`
/// flag says.
#[derive(Debug)]
pub struct EncryptedBlocksDevice<D: ByteDevice> {
    inner: D,
    cipher: Option<BlockCipher>,
    blocks_count: u32,
}

impl<D: ByteDevice> EncryptedBlocksDevice<D> {
    pub fn new(inner: D, key: Option<DeviceKey>) -> Result<Self> {
        let len = inner.len_bytes();
        let block_size = u64::from(BLOCK_SIZE);
        let remainder = len % block_size;
        if remainder != 0 {
            return Err(WfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let blocks_count = u32::try_from(len / block_size).map_err(|_| {
            WfsError::Format(format!("image too large: len_bytes={len}"))
        })?;
        Ok(Self {
            inner,
            cipher: key.map(BlockCipher::new),
            blocks_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn is_keyed(&self) -> bool {
        self.cipher.is_some()
    }

    fn check_request(&self, block: BlockNumber, params: &BlockParams) -> Result<()> {
        let end = block
            .checked_add(params.size_in_blocks)
            .ok_or(WfsError::OutOfRange {
                block: block.0,
                blocks_count: self.blocks_count,
            })?;
        if params.size_in_blocks == 0 || end.0 > self.blocks_count {
            return Err(WfsError::OutOfRange {
                block: block.0,
                blocks_count: self.blocks_count,
            });
        }
        let capacity = u64::from(params.size_in_blocks) * u64::from(BLOCK_SIZE);
        let data_size = u64::from(params.data_size);
        if data_size == 0 || data_size > capacity || params.data_len() % CIPHER_BLOCK_SIZE != 0 {
            return Err(WfsError::Format(format!(
                "invalid data size {} for {} block(s) at {block}",
                params.data_size, params.size_in_blocks
            )));
        }
        Ok(())
    }

    fn cipher_for(&self, params: &BlockParams) -> Option<&BlockCipher> {
        self.cipher.as_ref().filter(|_| params.encrypted)
    }
}

impl<D: ByteDevice> BlocksDevice for EncryptedBlocksDevice<D> {
    fn read_block(
        &self,
        block: BlockNumber,
        params: &BlockParams,
        hash: HashCheck<'_>,
    ) -> Result<BlockBuf> {
        self.check_request(block, params)?;
        let mut buf = vec![0_u8; params.data_len()];
        self.inner.read_exact_at(block.byte_offset(), &mut buf)?;
        if let Some(cipher) = self.cipher_for(params) {
            cipher.decrypt(&mut buf, params.iv)?;
        }

        let valid = match hash {
            HashCheck::Skip => true,
            HashCheck::Embedded => verify_embedded_hash(&buf),
            HashCheck::Expected(expected) => block_hash(&buf) == *expected,
        };
        if !valid {
            return Err(WfsError::HashMismatch { block: block.0 });
        }
        trace!(%block, data_size = params.data_size, "read block");
        Ok(BlockBuf::new(buf))
    }

    fn write_block(
        &self,
        block: BlockNumber,
        params: &BlockParams,
        data: &[u8],
        hash: HashUpdate,
    ) -> Result<()> {
        self.check_request(block, params)?;
        if data.len() != params.data_len() {
            return Err(WfsError::Format(format!(
                "write_block data size mismatch at {block}: got={} expected={}",
                data.len(),
                params.data_size
            )));
        }

        let mut buf = data.to_vec();
        if hash == HashUpdate::Recalculate {
            seal_embedded_hash(&mut buf)?;
        }
        if let Some(cipher) = self.cipher_for(params) {
            cipher.encrypt(&mut buf, params.iv)?;
        }
        self.inner.write_all_at(block.byte_offset(), &buf)?;
        trace!(%block, data_size = params.data_size, "wrote block");
        Ok(())
    }

    fn blocks_count(&self) -> u32 {
        self.blocks_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct MemoryByteDevice {
        bytes: Mutex<Vec<u8>>,
    }

    impl MemoryByteDevice {
        fn new(len: usize) -> Self {
            Self {
                bytes: Mutex::new(vec![0_u8; len]),
            }
        }

        fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
            self.bytes.lock()[offset..offset + len].to_vec()
        }
    }

    impl ByteDevice for MemoryByteDevice {
        fn len_bytes(&self) -> u64 {
            u64::try_from(self.bytes.lock().len()).unwrap_or(0)
        }

        fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            let offset =
                usize::try_from(offset).map_err(|_| WfsError::Format("offset overflow".into()))?;
            let bytes = self.bytes.lock();
            let src = bytes
                .get(offset..offset + buf.len())
                .ok_or_else(|| WfsError::Format("oob".into()))?;
            buf.copy_from_slice(src);
            drop(bytes);
            Ok(())
        }

        fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
            let offset =
                usize::try_from(offset).map_err(|_| WfsError::Format("offset overflow".into()))?;
            let mut bytes = self.bytes.lock();
            let dst = bytes
                .get_mut(offset..offset + buf.len())
                .ok_or_else(|| WfsError::Format("oob".into()))?;
            dst.copy_from_slice(buf);
            drop(bytes);
            Ok(())
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    const BLOCK: usize = BLOCK_SIZE as usize;

    fn keyed_device(blocks: usize) -> EncryptedBlocksDevice<MemoryByteDevice> {
        EncryptedBlocksDevice::new(
            MemoryByteDevice::new(BLOCK * blocks),
            Some(DeviceKey::new([9; 16])),
        )
        .expect("device")
    }

    #[test]
    fn metadata_round_trip_with_embedded_hash() {
        let dev = keyed_device(4);
        let params = BlockParams::metadata(BlockNumber(2));
        let mut data = vec![0_u8; BLOCK];
        data[64..72].copy_from_slice(b"metadata");
        dev.write_block(BlockNumber(2), &params, &data, HashUpdate::Recalculate)
            .expect("write");

        let raw = dev.inner().snapshot(2 * BLOCK + 64, 8);
        assert_ne!(raw, b"metadata", "block must be stored encrypted");

        let read = dev
            .read_block(BlockNumber(2), &params, HashCheck::Embedded)
            .expect("read");
        assert_eq!(&read.as_slice()[64..72], b"metadata");
    }

    #[test]
    fn wrong_iv_fails_hash_check() {
        let dev = keyed_device(2);
        let params = BlockParams::metadata(BlockNumber(1));
        dev.write_block(BlockNumber(1), &params, &[1_u8; BLOCK], HashUpdate::Recalculate)
            .expect("write");

        let wrong = BlockParams { iv: 0, ..params };
        let err = dev
            .read_block(BlockNumber(1), &wrong, HashCheck::Embedded)
            .expect_err("iv mismatch");
        assert!(matches!(err, WfsError::HashMismatch { block: 1 }));

        // Without verification the garbled bytes are returned as-is.
        assert!(
            dev.read_block(BlockNumber(1), &wrong, HashCheck::Skip)
                .is_ok()
        );
    }

    #[test]
    fn expected_hash_covers_data_blocks() {
        let dev = keyed_device(8);
        let params = BlockParams {
            size_in_blocks: 2,
            data_size: 4608,
            iv: 40,
            encrypted: true,
        };
        let data = vec![0x42_u8; 4608];
        dev.write_block(BlockNumber(5), &params, &data, HashUpdate::Keep)
            .expect("write");
        let hash = block_hash(&data);
        let read = dev
            .read_block(BlockNumber(5), &params, HashCheck::Expected(&hash))
            .expect("read");
        assert_eq!(read.as_slice(), data.as_slice());

        let other = block_hash(b"something else");
        assert!(
            dev.read_block(BlockNumber(5), &params, HashCheck::Expected(&other))
                .is_err()
        );
    }

    #[test]
    fn unkeyed_device_stores_clear_text() {
        let dev = EncryptedBlocksDevice::new(MemoryByteDevice::new(BLOCK * 2), None)
            .expect("device");
        let params = BlockParams::metadata(BlockNumber(1));
        let mut data = vec![0_u8; BLOCK];
        data[100..104].copy_from_slice(b"WFS!");
        dev.write_block(BlockNumber(1), &params, &data, HashUpdate::Keep)
            .expect("write");
        assert_eq!(dev.inner().snapshot(BLOCK + 100, 4), b"WFS!");
    }

    #[test]
    fn requests_are_bounds_and_size_checked() {
        let dev = keyed_device(4);
        let too_far = BlockParams {
            size_in_blocks: 2,
            ..BlockParams::metadata(BlockNumber(3))
        };
        assert!(matches!(
            dev.read_block(BlockNumber(3), &too_far, HashCheck::Skip),
            Err(WfsError::OutOfRange { block: 3, blocks_count: 4 })
        ));

        let oversized = BlockParams {
            data_size: BLOCK_SIZE * 2,
            ..BlockParams::metadata(BlockNumber(0))
        };
        assert!(matches!(
            dev.read_block(BlockNumber(0), &oversized, HashCheck::Skip),
            Err(WfsError::Format(_))
        ));

        let params = BlockParams::metadata(BlockNumber(0));
        assert!(matches!(
            dev.write_block(BlockNumber(0), &params, &[0_u8; 16], HashUpdate::Keep),
            Err(WfsError::Format(_))
        ));
    }

    #[test]
    fn unaligned_images_are_rejected() {
        let err = EncryptedBlocksDevice::new(MemoryByteDevice::new(BLOCK + 1), None)
            .expect_err("unaligned");
        assert!(err.to_string().contains("not block-aligned"));
    }

    #[test]
    fn file_device_create_and_read_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.bin");
        let dev = FileByteDevice::create(&path, 8192).expect("create");
        assert_eq!(dev.len_bytes(), 8192);
        dev.write_all_at(4096, b"hello").expect("write");
        dev.sync().expect("sync");

        let ro = FileByteDevice::open_read_only(&path).expect("open");
        assert!(!ro.is_writable());
        let mut buf = [0_u8; 5];
        ro.read_exact_at(4096, &mut buf).expect("read");
        assert_eq!(&buf, b"hello");
        assert!(matches!(ro.write_all_at(0, b"x"), Err(WfsError::ReadOnly)));
        assert!(ro.read_exact_at(8190, &mut buf).is_err());
    }
}
