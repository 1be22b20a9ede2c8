#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::env::VarError;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wfs_block::{EncryptedBlocksDevice, FileByteDevice};
use wfs_core::{WfsDevice, detect_device, dump_allocators};
use wfs_crypto::{KeyScheme, KeySource};
use wfs_error::WfsError;
use wfs_reencrypt::{
    ExploreFailure, ExploreObserver, ExploreProgress, Inventory, NoExploreProgress, ReencryptJob,
    TranscodeObserver, TranscodeProgress, discover,
};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

// ── Logging ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "WFS_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_env_filter(default_env_filter())
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "wfs", about = "WFS image toolkit: allocator report, block scan, re-encryption")]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `WFS_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report the free-block allocator state of every area.
    Info {
        #[command(flatten)]
        image: ImageArgs,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Walk the filesystem and inventory every block it uses.
    Scan {
        #[command(flatten)]
        image: ImageArgs,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Re-encrypt an image under another key.
    Reencrypt(ReencryptArgs),
}

#[derive(Debug, Args)]
struct ImageArgs {
    /// Input image.
    #[arg(long)]
    input: PathBuf,
    /// Key type (usb/mlc/plain).
    #[arg(long = "type", default_value = "usb", value_parser = parse_key_scheme)]
    key_type: KeyScheme,
    /// OTP file (for usb/mlc types).
    #[arg(long)]
    otp: Option<PathBuf>,
    /// SEEPROM file (for usb type).
    #[arg(long)]
    seeprom: Option<PathBuf>,
}

impl ImageArgs {
    fn key_source(&self) -> KeySource {
        KeySource {
            scheme: self.key_type,
            otp: self.otp.clone(),
            seeprom: self.seeprom.clone(),
        }
    }
}

#[derive(Debug, Args)]
struct ReencryptArgs {
    /// Input image.
    #[arg(long)]
    input: PathBuf,
    /// Input key type (usb/mlc/plain).
    #[arg(long, default_value = "usb", value_parser = parse_key_scheme)]
    input_type: KeyScheme,
    /// Input OTP file (for usb/mlc types).
    #[arg(long)]
    input_otp: Option<PathBuf>,
    /// Input SEEPROM file (for usb type).
    #[arg(long)]
    input_seeprom: Option<PathBuf>,
    /// Output image (default: re-encrypt the input in place).
    #[arg(long)]
    output: Option<PathBuf>,
    /// Output key type (default: same as input).
    #[arg(long, value_parser = parse_key_scheme)]
    output_type: Option<KeyScheme>,
    /// Output OTP file (for usb/mlc types).
    #[arg(long)]
    output_otp: Option<PathBuf>,
    /// Output SEEPROM file (for usb type).
    #[arg(long)]
    output_seeprom: Option<PathBuf>,
}

impl ReencryptArgs {
    fn input_keys(&self) -> KeySource {
        KeySource {
            scheme: self.input_type,
            otp: self.input_otp.clone(),
            seeprom: self.input_seeprom.clone(),
        }
    }

    fn output_keys(&self) -> KeySource {
        KeySource {
            scheme: self.output_type.unwrap_or(self.input_type),
            otp: self.output_otp.clone(),
            seeprom: self.output_seeprom.clone(),
        }
    }
}

fn parse_key_scheme(raw: &str) -> Result<KeyScheme, WfsError> {
    raw.parse()
}

// ── Entry point ─────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;
    execute(cli.command)
}

fn execute(command: Command) -> Result<()> {
    match command {
        Command::Info { image, json } => info_cmd(&image, json),
        Command::Scan { image, json } => scan_cmd(&image, json),
        Command::Reencrypt(args) => reencrypt_cmd(&args),
    }
}

/// Give wrong-key detection failures their remediation hint.
fn explain(err: WfsError) -> anyhow::Error {
    if err.is_wrong_key() {
        anyhow!("incorrect WFS version, possibly wrong keys ({err})")
    } else {
        anyhow::Error::new(err)
    }
}

fn open_image(image: &ImageArgs) -> Result<EncryptedBlocksDevice<FileByteDevice>> {
    let key = image.key_source().load()?;
    let file = FileByteDevice::open_read_only(&image.input)
        .with_context(|| format!("failed to open {}", image.input.display()))?;
    let dev = EncryptedBlocksDevice::new(file, key)?;
    detect_device(&dev).map_err(explain)?;
    Ok(dev)
}

// ── info ────────────────────────────────────────────────────────────────────

fn info_cmd(image: &ImageArgs, json: bool) -> Result<()> {
    let dev = open_image(image)?;
    let wfs = WfsDevice::open(&dev).map_err(explain)?;
    let dump = dump_allocators(&wfs)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&dump).context("serialize allocator report")?
        );
    } else {
        print!("{dump}");
    }
    Ok(())
}

// ── scan ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct FailureOutput {
    path: String,
    target: String,
    error: String,
}

impl From<&ExploreFailure> for FailureOutput {
    fn from(failure: &ExploreFailure) -> Self {
        Self {
            path: failure.path.clone(),
            target: failure.target.to_string(),
            error: failure.error.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ScanOutput<'a> {
    inventory: &'a Inventory,
    failures: Vec<FailureOutput>,
}

fn scan_cmd(image: &ImageArgs, json: bool) -> Result<()> {
    let dev = open_image(image)?;
    let discovery = if json {
        discover(&dev, &mut NoExploreProgress)
    } else {
        discover(&dev, &mut ExploreLine)
    }
    .map_err(explain)?;

    if json {
        let output = ScanOutput {
            inventory: &discovery.inventory,
            failures: discovery.failures.iter().map(FailureOutput::from).collect(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize scan output")?
        );
        return Ok(());
    }

    println!();
    report_failures(&discovery.failures);
    let inventory = &discovery.inventory;
    println!(
        "{} blocks, {:.2} GB in use",
        inventory.blocks_count(),
        gigabytes(inventory.bytes_count())
    );
    if inventory.bad_blocks_count() > 0 {
        println!("{} bad blocks:", inventory.bad_blocks_count());
        for descriptor in inventory.bad_blocks() {
            println!("\t{}", descriptor.block_number);
        }
    }
    Ok(())
}

// ── reencrypt ───────────────────────────────────────────────────────────────

fn reencrypt_cmd(args: &ReencryptArgs) -> Result<()> {
    let job = ReencryptJob::new(
        &args.input,
        args.input_keys(),
        args.output.clone(),
        args.output_keys(),
    )?;
    let report = job
        .run(&mut ExploreLine, &mut TranscodeLine)
        .map_err(explain)?;

    println!();
    report_failures(&report.discovery.failures);
    info!(
        blocks = report.summary.blocks,
        bytes = report.summary.bytes,
        skipped_bad_blocks = report.summary.skipped_bad_blocks,
        in_place = report.in_place,
        "re-encryption finished"
    );
    println!("Done!");
    Ok(())
}

fn report_failures(failures: &[ExploreFailure]) {
    for failure in failures {
        eprintln!("Error: {failure}");
    }
}

// ── Progress lines ──────────────────────────────────────────────────────────

#[allow(clippy::cast_precision_loss)]
fn gigabytes(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

fn flush_stdout() {
    let _ = io::stdout().flush();
}

struct ExploreLine;

impl ExploreObserver for ExploreLine {
    fn on_progress(&mut self, progress: &ExploreProgress<'_>) {
        print!(
            "Exploring: {:6.2} GB | {:8} blocks | {:64}\r",
            gigabytes(progress.bytes),
            progress.blocks,
            progress.location
        );
        flush_stdout();
    }
}

struct TranscodeLine;

impl TranscodeObserver for TranscodeLine {
    fn on_progress(&mut self, progress: &TranscodeProgress) {
        print!(
            "Reencrypting: {:8}/{} blocks | {:6.2}/{:.2} GB [{:.2}%]\r",
            progress.blocks_done,
            progress.blocks_total,
            gigabytes(progress.bytes_done),
            gigabytes(progress.bytes_total),
            progress.percent()
        );
        flush_stdout();
    }
}
