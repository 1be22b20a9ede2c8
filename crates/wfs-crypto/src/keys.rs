//! Key files and key-scheme selection.
//!
//! Three schemes exist:
//!
//! | Scheme | Credentials | Key |
//! |--------|-------------|-----|
//! | `mlc` | OTP | OTP bytes `0x180..0x190` |
//! | `usb` | OTP + SEEPROM | SEEPROM seed `0xB0..0xC0` encrypted (AES-128-ECB) with OTP bytes `0x130..0x140` |
//! | `plain` | none | no key, blocks stored in clear |
//!
//! [`KeySource::validate`] checks the credential combination without
//! touching the filesystem so callers can reject bad arguments before any
//! device I/O.

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;
use wfs_error::{Result, WfsError};

pub const OTP_SIZE: usize = 0x400;
pub const SEEPROM_SIZE: usize = 0x200;

const OTP_MLC_KEY_OFFSET: usize = 0x180;
const OTP_USB_SEED_KEY_OFFSET: usize = 0x130;
const SEEPROM_USB_SEED_OFFSET: usize = 0xB0;
const KEY_SIZE: usize = 16;

/// 128-bit block encryption key. `Debug` never prints the key bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeviceKey([u8; KEY_SIZE]);

impl DeviceKey {
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            WfsError::Config(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; KEY_SIZE] {
        self.0
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceKey(..)")
    }
}

fn key_at(data: &[u8], offset: usize) -> [u8; KEY_SIZE] {
    let mut key = [0_u8; KEY_SIZE];
    key.copy_from_slice(&data[offset..offset + KEY_SIZE]);
    key
}

fn load_fixed(path: &Path, expected: usize, what: &str) -> Result<Vec<u8>> {
    let data = std::fs::read(path)?;
    if data.len() != expected {
        return Err(WfsError::Config(format!(
            "{what} file {} has {} bytes, expected {expected}",
            path.display(),
            data.len()
        )));
    }
    Ok(data)
}

/// One-time-programmable key store dump.
#[derive(Clone)]
pub struct Otp {
    data: Vec<u8>,
}

impl Otp {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() != OTP_SIZE {
            return Err(WfsError::Config(format!(
                "OTP must be {OTP_SIZE} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self { data })
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(load_fixed(path.as_ref(), OTP_SIZE, "OTP")?)
    }

    #[must_use]
    pub fn mlc_key(&self) -> DeviceKey {
        DeviceKey(key_at(&self.data, OTP_MLC_KEY_OFFSET))
    }

    #[must_use]
    pub fn usb_seed_encryption_key(&self) -> DeviceKey {
        DeviceKey(key_at(&self.data, OTP_USB_SEED_KEY_OFFSET))
    }
}

impl fmt::Debug for Otp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Otp").field("len", &self.data.len()).finish()
    }
}

/// Serial EEPROM dump.
#[derive(Clone)]
pub struct Seeprom {
    data: Vec<u8>,
}

impl Seeprom {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() != SEEPROM_SIZE {
            return Err(WfsError::Config(format!(
                "SEEPROM must be {SEEPROM_SIZE} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self { data })
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(load_fixed(path.as_ref(), SEEPROM_SIZE, "SEEPROM")?)
    }

    #[must_use]
    pub fn usb_key_seed(&self) -> [u8; KEY_SIZE] {
        key_at(&self.data, SEEPROM_USB_SEED_OFFSET)
    }

    /// Derive the USB storage key: the seed encrypted with the OTP seed key.
    #[must_use]
    pub fn usb_key(&self, otp: &Otp) -> DeviceKey {
        let cipher = Aes128::new(&otp.usb_seed_encryption_key().bytes().into());
        let mut block = aes::Block::from(self.usb_key_seed());
        cipher.encrypt_block(&mut block);
        let mut key = [0_u8; KEY_SIZE];
        key.copy_from_slice(&block);
        DeviceKey(key)
    }
}

impl fmt::Debug for Seeprom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seeprom")
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScheme {
    Usb,
    Mlc,
    Plain,
}

impl KeyScheme {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usb => "usb",
            Self::Mlc => "mlc",
            Self::Plain => "plain",
        }
    }

    #[must_use]
    pub const fn needs_otp(self) -> bool {
        matches!(self, Self::Usb | Self::Mlc)
    }

    #[must_use]
    pub const fn needs_seeprom(self) -> bool {
        matches!(self, Self::Usb)
    }
}

impl FromStr for KeyScheme {
    type Err = WfsError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "usb" => Ok(Self::Usb),
            "mlc" => Ok(Self::Mlc),
            "plain" => Ok(Self::Plain),
            other => Err(WfsError::Config(format!(
                "invalid key type {other:?} (valid types: usb/mlc/plain)"
            ))),
        }
    }
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a device key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySource {
    pub scheme: KeyScheme,
    pub otp: Option<PathBuf>,
    pub seeprom: Option<PathBuf>,
}

impl KeySource {
    #[must_use]
    pub fn plain() -> Self {
        Self {
            scheme: KeyScheme::Plain,
            otp: None,
            seeprom: None,
        }
    }

    /// Check that the credentials required by the scheme are present.
    ///
    /// Pure argument check: no file is opened.
    pub fn validate(&self) -> Result<()> {
        if self.scheme.needs_otp() && self.otp.is_none() {
            return Err(WfsError::Config(format!(
                "missing OTP file for {} key type",
                self.scheme
            )));
        }
        if self.scheme.needs_seeprom() && self.seeprom.is_none() {
            return Err(WfsError::Config(format!(
                "missing SEEPROM file for {} key type",
                self.scheme
            )));
        }
        Ok(())
    }

    /// Load the key described by this source. `plain` yields `None`.
    pub fn load(&self) -> Result<Option<DeviceKey>> {
        self.validate()?;
        let key = match (self.scheme, &self.otp, &self.seeprom) {
            (KeyScheme::Plain, _, _) => None,
            (KeyScheme::Mlc, Some(otp), _) => Some(Otp::load_from_file(otp)?.mlc_key()),
            (KeyScheme::Usb, Some(otp), Some(seeprom)) => {
                let otp = Otp::load_from_file(otp)?;
                Some(Seeprom::load_from_file(seeprom)?.usb_key(&otp))
            }
            (scheme, _, _) => {
                return Err(WfsError::Config(format!(
                    "incomplete credentials for {scheme} key type"
                )));
            }
        };
        debug!(scheme = %self.scheme, keyed = key.is_some(), "loaded device key");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn otp_bytes() -> Vec<u8> {
        let mut otp = vec![0_u8; OTP_SIZE];
        otp[OTP_MLC_KEY_OFFSET..OTP_MLC_KEY_OFFSET + KEY_SIZE].fill(0x11);
        otp[OTP_USB_SEED_KEY_OFFSET..OTP_USB_SEED_KEY_OFFSET + KEY_SIZE].fill(0x22);
        otp
    }

    fn seeprom_bytes() -> Vec<u8> {
        let mut seeprom = vec![0_u8; SEEPROM_SIZE];
        seeprom[SEEPROM_USB_SEED_OFFSET..SEEPROM_USB_SEED_OFFSET + KEY_SIZE].fill(0x33);
        seeprom
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(bytes).expect("write");
        file
    }

    #[test]
    fn mlc_key_is_read_from_otp() {
        let otp = Otp::from_bytes(otp_bytes()).expect("otp");
        assert_eq!(otp.mlc_key().bytes(), [0x11; 16]);
    }

    #[test]
    fn usb_key_is_encrypted_seed() {
        let otp = Otp::from_bytes(otp_bytes()).expect("otp");
        let seeprom = Seeprom::from_bytes(seeprom_bytes()).expect("seeprom");
        let key = seeprom.usb_key(&otp);
        assert_ne!(key.bytes(), [0x33; 16]);
        // Deterministic for the same inputs.
        assert_eq!(key, seeprom.usb_key(&otp));
    }

    #[test]
    fn wrong_sized_dumps_are_rejected() {
        assert!(matches!(
            Otp::from_bytes(vec![0; 10]),
            Err(WfsError::Config(_))
        ));
        assert!(matches!(
            Seeprom::from_bytes(vec![0; OTP_SIZE]),
            Err(WfsError::Config(_))
        ));
    }

    #[test]
    fn scheme_parsing() {
        assert_eq!("usb".parse::<KeyScheme>().expect("usb"), KeyScheme::Usb);
        assert_eq!("mlc".parse::<KeyScheme>().expect("mlc"), KeyScheme::Mlc);
        assert_eq!(
            "plain".parse::<KeyScheme>().expect("plain"),
            KeyScheme::Plain
        );
        let err = "sd".parse::<KeyScheme>().expect_err("unknown type");
        assert!(err.to_string().contains("usb/mlc/plain"));
    }

    #[test]
    fn validation_needs_no_files() {
        let missing = PathBuf::from("/nonexistent/otp.bin");
        let mlc = KeySource {
            scheme: KeyScheme::Mlc,
            otp: Some(missing.clone()),
            seeprom: None,
        };
        assert!(mlc.validate().is_ok());

        let usb_without_seeprom = KeySource {
            scheme: KeyScheme::Usb,
            otp: Some(missing),
            seeprom: None,
        };
        let err = usb_without_seeprom.validate().expect_err("seeprom missing");
        assert!(err.to_string().contains("SEEPROM"));

        let usb_without_anything = KeySource {
            scheme: KeyScheme::Usb,
            otp: None,
            seeprom: None,
        };
        let err = usb_without_anything.validate().expect_err("otp missing");
        assert!(err.to_string().contains("OTP"));

        assert!(KeySource::plain().validate().is_ok());
    }

    #[test]
    fn load_reads_credential_files() {
        let otp = write_temp(&otp_bytes());
        let seeprom = write_temp(&seeprom_bytes());

        let mlc = KeySource {
            scheme: KeyScheme::Mlc,
            otp: Some(otp.path().to_path_buf()),
            seeprom: None,
        };
        assert_eq!(
            mlc.load().expect("mlc").map(|k| k.bytes()),
            Some([0x11; 16])
        );

        let usb = KeySource {
            scheme: KeyScheme::Usb,
            otp: Some(otp.path().to_path_buf()),
            seeprom: Some(seeprom.path().to_path_buf()),
        };
        let expected = Seeprom::from_bytes(seeprom_bytes())
            .expect("seeprom")
            .usb_key(&Otp::from_bytes(otp_bytes()).expect("otp"));
        assert_eq!(usb.load().expect("usb"), Some(expected));

        assert_eq!(KeySource::plain().load().expect("plain"), None);
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = DeviceKey::new([0xAA; 16]);
        assert_eq!(format!("{key:?}"), "DeviceKey(..)");
    }
}
