//! SHA-1 block hashes.
//!
//! Data blocks are hashed whole and the hash lives in the owning file's
//! metadata. Metadata blocks carry their own hash in the first
//! [`HASH_SIZE`] bytes, computed over the rest of the block.

use sha1::{Digest, Sha1};
use wfs_error::{Result, WfsError};
use wfs_types::{BlockHash, HASH_SIZE};

#[must_use]
pub fn block_hash(data: &[u8]) -> BlockHash {
    let digest = Sha1::digest(data);
    let mut out = [0_u8; HASH_SIZE];
    out.copy_from_slice(&digest);
    out
}

/// Hash of a metadata block, excluding the embedded hash field.
pub fn embedded_hash(block: &[u8]) -> Result<BlockHash> {
    let payload = block.get(HASH_SIZE..).ok_or_else(|| {
        WfsError::Format(format!(
            "metadata block too short for embedded hash: len={}",
            block.len()
        ))
    })?;
    Ok(block_hash(payload))
}

/// Recompute and store the embedded hash of a metadata block.
pub fn seal_embedded_hash(block: &mut [u8]) -> Result<()> {
    let hash = embedded_hash(block)?;
    block[..HASH_SIZE].copy_from_slice(&hash);
    Ok(())
}

/// Whether the embedded hash matches the block contents.
#[must_use]
pub fn verify_embedded_hash(block: &[u8]) -> bool {
    embedded_hash(block).is_ok_and(|hash| block[..HASH_SIZE] == hash)
}
