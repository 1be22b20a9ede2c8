//! File-to-file (or in-place) re-encryption job.

use std::path::{Path, PathBuf};

use tracing::info;
use wfs_block::{ByteDevice, EncryptedBlocksDevice, FileByteDevice};
use wfs_crypto::KeySource;
use wfs_error::{Result, WfsError};

use crate::transcoder::{TranscodeObserver, TranscodeSummary};
use crate::walker::ExploreObserver;
use crate::{Discovery, transcode_device};

/// A validated re-encryption request.
///
/// Construction checks both key sources; no file is touched until
/// [`ReencryptJob::run`].
#[derive(Debug, Clone)]
pub struct ReencryptJob {
    input: PathBuf,
    input_keys: KeySource,
    output: Option<PathBuf>,
    output_keys: KeySource,
}

#[derive(Debug)]
pub struct JobReport {
    pub discovery: Discovery,
    pub summary: TranscodeSummary,
    /// The input image was rewritten rather than copied.
    pub in_place: bool,
}

impl ReencryptJob {
    /// `output: None` re-encrypts `input` in place.
    pub fn new(
        input: impl Into<PathBuf>,
        input_keys: KeySource,
        output: Option<PathBuf>,
        output_keys: KeySource,
    ) -> Result<Self> {
        input_keys.validate()?;
        output_keys.validate()?;
        Ok(Self {
            input: input.into(),
            input_keys,
            output,
            output_keys,
        })
    }

    #[must_use]
    pub fn input(&self) -> &Path {
        &self.input
    }

    #[must_use]
    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    pub fn run(
        &self,
        explore: &mut dyn ExploreObserver,
        transcode: &mut dyn TranscodeObserver,
    ) -> Result<JobReport> {
        let input_key = self.input_keys.load()?;
        let output_key = self.output_keys.load()?;

        let (input_file, output_file) = match &self.output {
            Some(output) => {
                let input_file = FileByteDevice::open_read_only(&self.input)?;
                // Detect before creating the output so a wrong key leaves no file behind.
                let source = EncryptedBlocksDevice::new(input_file.clone(), input_key)?;
                wfs_core::detect_device(&source)?;
                let output_file = FileByteDevice::create(output, input_file.len_bytes())?;
                (input_file, output_file)
            }
            None => {
                let input_file = FileByteDevice::open(&self.input)?;
                if !input_file.is_writable() {
                    return Err(WfsError::ReadOnly);
                }
                (input_file.clone(), input_file)
            }
        };

        info!(
            input = %self.input.display(),
            input_type = %self.input_keys.scheme,
            output = %self.output.as_deref().unwrap_or(&self.input).display(),
            output_type = %self.output_keys.scheme,
            "starting re-encryption"
        );
        let source = EncryptedBlocksDevice::new(input_file, input_key)?;
        let destination = EncryptedBlocksDevice::new(output_file, output_key)?;
        let (discovery, summary) = transcode_device(&source, &destination, explore, transcode)?;
        Ok(JobReport {
            discovery,
            summary,
            in_place: self.output.is_none(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcoder::NoTranscodeProgress;
    use crate::walker::NoExploreProgress;
    use wfs_crypto::KeyScheme;

    #[test]
    fn missing_credentials_are_rejected_up_front() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("does-not-exist.img");
        let usb = KeySource {
            scheme: KeyScheme::Usb,
            otp: Some(dir.path().join("otp.bin")),
            seeprom: None,
        };
        let err = ReencryptJob::new(&input, usb, None, KeySource::plain()).expect_err("config");
        assert!(matches!(err, WfsError::Config(_)));

        let mlc = KeySource {
            scheme: KeyScheme::Mlc,
            otp: None,
            seeprom: None,
        };
        let err = ReencryptJob::new(&input, KeySource::plain(), Some(dir.path().join("out.img")), mlc)
            .expect_err("config");
        assert!(matches!(err, WfsError::Config(_)));
        assert!(!dir.path().join("out.img").exists());
    }

    #[test]
    fn missing_input_fails_without_creating_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("out.img");
        let job = ReencryptJob::new(
            dir.path().join("missing.img"),
            KeySource::plain(),
            Some(output.clone()),
            KeySource::plain(),
        )
        .expect("valid job");
        assert!(job.run(&mut NoExploreProgress, &mut NoTranscodeProgress).is_err());
        assert!(!output.exists());
    }
}
