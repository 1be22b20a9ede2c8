#![forbid(unsafe_code)]
//! Error types for the WFS toolset.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `wfs-types` | Metadata block layout violations found while decoding bytes |
//! | Runtime | `WfsError` | `wfs-error` (this crate) | Everything surfaced to library callers and the CLI |
//!
//! `wfs-error` does not depend on `wfs-types`. The conversion from
//! `ParseError` to `WfsError::Corruption` happens in `wfs-core`, which knows
//! the block number the bytes came from.
//!
//! ## How the tools treat each variant
//!
//! | Variant | Raised by | Tool reaction |
//! |---------|-----------|---------------|
//! | `Config` | key-source validation, CLI argument checks | fatal, before any device I/O |
//! | `InvalidWfsVersion` | device detection | fatal, with a "check your keys" hint |
//! | `HashMismatch` | block reads with hash verification | recorded as a bad block during discovery; per-node failure |
//! | `Corruption` / `Format` | metadata decoding | per-node failure during traversal |
//! | `OutOfRange` | area or device bounds checks | per-node failure during traversal |
//! | `Io` | byte devices | fatal unless it happens inside a single traversal step |
//!
//! All string payloads are owned so errors can be collected into reports.

use thiserror::Error;

/// Unified error type for all WFS operations.
#[derive(Debug, Error)]
pub enum WfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device header does not carry the expected version.
    ///
    /// With a valid image this almost always means the block key is wrong,
    /// so it is reported apart from generic format errors.
    #[error("incorrect WFS version (expected {expected:#010x}, got {actual:#010x}), possibly wrong keys")]
    InvalidWfsVersion { expected: u32, actual: u32 },

    /// A block failed its integrity hash after decryption.
    #[error("block {block:#010x} failed hash verification")]
    HashMismatch { block: u32 },

    /// Metadata at a known block decoded to something invalid.
    #[error("corrupt metadata at block {block:#010x}: {detail}")]
    Corruption { block: u32, detail: String },

    /// Invalid request or image geometry (alignment, sizes, lengths).
    #[error("invalid format: {0}")]
    Format(String),

    /// A block address falls outside its device or area.
    #[error("block {block:#010x} out of range (blocks_count={blocks_count:#x})")]
    OutOfRange { block: u32, blocks_count: u32 },

    /// Key material or argument combination is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A write was attempted on a device opened read-only.
    #[error("read-only device")]
    ReadOnly,

    /// No free blocks left in an area.
    #[error("no space left in area")]
    NoSpace,

    /// Entry name exceeds the 255-byte on-disk limit.
    #[error("name too long: {0}")]
    NameTooLong(String),

    /// A named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl WfsError {
    /// True when the failure points at wrong key material rather than a
    /// damaged or foreign image.
    #[must_use]
    pub fn is_wrong_key(&self) -> bool {
        matches!(self, Self::InvalidWfsVersion { .. })
    }

    /// True for failures caused by block contents (bad decryption, hash
    /// mismatch, undecodable metadata) rather than by the environment.
    #[must_use]
    pub fn is_block_damage(&self) -> bool {
        matches!(self, Self::HashMismatch { .. } | Self::Corruption { .. })
    }
}

/// Result alias using `WfsError`.
pub type Result<T> = std::result::Result<T, WfsError>;
