//! AES-128-CBC block encryption.
//!
//! Each block is encrypted independently. The 16-byte CBC IV is derived from
//! the encrypted length and the block's 32-bit IV value:
//!
//! | Bytes | Content |
//! |-------|---------|
//! | 0..4 | data length, big-endian |
//! | 4..8 | zero |
//! | 8..12 | block IV, big-endian |
//! | 12..16 | zero |

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use wfs_error::{Result, WfsError};

use crate::keys::DeviceKey;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block length; encrypted payloads must be a multiple of it.
pub const CIPHER_BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct BlockCipher {
    key: DeviceKey,
}

impl BlockCipher {
    #[must_use]
    pub fn new(key: DeviceKey) -> Self {
        Self { key }
    }

    pub fn encrypt(&self, data: &mut [u8], iv: u32) -> Result<()> {
        let cbc_iv = derive_iv(data.len(), iv)?;
        let len = data.len();
        Aes128CbcEnc::new(&self.key.bytes().into(), &cbc_iv.into())
            .encrypt_padded_mut::<NoPadding>(data, len)
            .map_err(|_| WfsError::Format(format!("cannot encrypt {len} bytes")))?;
        Ok(())
    }

    pub fn decrypt(&self, data: &mut [u8], iv: u32) -> Result<()> {
        let cbc_iv = derive_iv(data.len(), iv)?;
        let len = data.len();
        Aes128CbcDec::new(&self.key.bytes().into(), &cbc_iv.into())
            .decrypt_padded_mut::<NoPadding>(data)
            .map_err(|_| WfsError::Format(format!("cannot decrypt {len} bytes")))?;
        Ok(())
    }
}

fn derive_iv(len: usize, iv: u32) -> Result<[u8; 16]> {
    if len == 0 || len % CIPHER_BLOCK_SIZE != 0 {
        return Err(WfsError::Format(format!(
            "encrypted length must be a non-zero multiple of {CIPHER_BLOCK_SIZE}: len={len}"
        )));
    }
    let len = u32::try_from(len)
        .map_err(|_| WfsError::Format(format!("encrypted length overflows u32: {len}")))?;
    let mut out = [0_u8; 16];
    out[0..4].copy_from_slice(&len.to_be_bytes());
    out[8..12].copy_from_slice(&iv.to_be_bytes());
    Ok(out)
}
