#![forbid(unsafe_code)]
//! Cryptographic services for WFS images.
//!
//! - [`keys`]: OTP / SEEPROM key files and key-scheme selection.
//! - [`cipher`]: AES-128-CBC block encryption keyed per device.
//! - [`hash`]: SHA-1 integrity hashes for data and metadata blocks.

pub mod cipher;
pub mod hash;
pub mod keys;

pub use cipher::BlockCipher;
pub use hash::{block_hash, embedded_hash, seal_embedded_hash, verify_embedded_hash};
pub use keys::{DeviceKey, KeyScheme, KeySource, Otp, Seeprom};
