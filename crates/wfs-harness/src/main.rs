#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use std::env;
use std::path::{Path, PathBuf};
use wfs_block::{EncryptedBlocksDevice, FileByteDevice};
use wfs_crypto::{KeyScheme, KeySource};
use wfs_harness::{ImageBuilder, load_image_spec, parse_key_hex, write_key_files};
use wfs_types::BLOCK_SIZE;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("make-image") => make_image(&args[1..]),
        Some("make-keys") => make_keys(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn make_image(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        bail!(
            "usage: wfs-harness make-image <spec.json> <out.img> [--key-hex <hex>] [--type <usb|mlc|plain>] [--otp <path>] [--seeprom <path>]"
        );
    }
    let spec_path = Path::new(&args[0]);
    let out_path = Path::new(&args[1]);

    let mut key_hex = None;
    let mut source = KeySource::plain();
    let mut index = 2_usize;
    while index < args.len() {
        let value = args
            .get(index + 1)
            .with_context(|| format!("{} requires a value", args[index]))?;
        match args[index].as_str() {
            "--key-hex" => key_hex = Some(value.clone()),
            "--type" => source.scheme = value.parse::<KeyScheme>()?,
            "--otp" => source.otp = Some(PathBuf::from(value)),
            "--seeprom" => source.seeprom = Some(PathBuf::from(value)),
            other => bail!("unknown make-image option: {other}"),
        }
        index += 2;
    }

    let key = match key_hex {
        Some(raw) => Some(parse_key_hex(&raw)?),
        None => source.load()?,
    };

    let spec = load_image_spec(spec_path)?;
    let len = u64::from(spec.blocks_count) * u64::from(BLOCK_SIZE);
    let file = FileByteDevice::create(out_path, len)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    let dev = EncryptedBlocksDevice::new(file, key)?;
    let built = ImageBuilder::new(spec).build(&dev)?;

    println!(
        "wrote {}: {} blocks, {} files, {} areas",
        out_path.display(),
        built.blocks.len(),
        built.files.len(),
        built.areas.len()
    );
    Ok(())
}

fn make_keys(args: &[String]) -> Result<()> {
    let Some(dir) = args.first() else {
        bail!("usage: wfs-harness make-keys <dir> [--seed <n>]");
    };
    let seed = match args.get(1).map(String::as_str) {
        Some("--seed") => args
            .get(2)
            .context("--seed requires a value")?
            .parse()
            .context("invalid --seed value")?,
        Some(other) => bail!("unknown make-keys option: {other}"),
        None => 0,
    };
    let files = write_key_files(Path::new(dir), seed)?;
    println!("otp: {}", files.otp.display());
    println!("seeprom: {}", files.seeprom.display());
    Ok(())
}

fn print_usage() {
    println!("wfs-harness: synthetic WFS image tooling");
    println!();
    println!("commands:");
    println!("  make-image <spec.json> <out.img> [--key-hex <hex>] [--type <t>] [--otp <p>] [--seeprom <p>]");
    println!("  make-keys <dir> [--seed <n>]");
}
