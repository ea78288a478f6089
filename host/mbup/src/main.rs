mod io;
mod tty;
mod upload;

use clap::Parser;
use std::ffi::OsStr;
use std::fs::DirEntry;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use tracing_subscriber::util::SubscriberInitExt;

fn main() {
    color_eyre::install().expect("Failed to install `color_eyre`");

    let args = Args::parse();

    tracing_subscriber::fmt::Subscriber::builder()
        .without_time()
        .with_max_level(match (args.quiet, args.verbose) {
            (true, _) => tracing::Level::ERROR,
            (false, 0) => tracing::Level::INFO,
            (false, 1) => tracing::Level::DEBUG,
            (false, _) => tracing::Level::TRACE,
        })
        .finish()
        .init();

    let device = args.device.clone().unwrap_or_else(|| {
        tracing::warn!("no device specified, searching for suitable TTY");
        if let Some(most_recent_device) = find_most_recent_tty() {
            tracing::info!("using device {}", most_recent_device.display());
            most_recent_device
        } else {
            tracing::error!("failed to find suitable TTY device");
            tracing::error!(
                "expected device in /dev like one of: {}",
                PATTERNS
                    .iter()
                    .map(|p| format!("{p}*"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            std::process::exit(1);
        }
    });

    if !args.rom_file.is_file() {
        tracing::error!("{} is not a file, exiting", args.rom_file.display());
        std::process::exit(1);
    }
    if !args
        .rom_file
        .extension()
        .map(|e| e == OsStr::new("gba"))
        .unwrap_or(false)
    {
        tracing::warn!("{} does not look like a .gba file", args.rom_file.display());
    }

    if let Err(e) = upload::upload(&args, &device) {
        tracing::error!("failed to upload: {e}");
        std::process::exit(1);
    }
    tracing::info!("done");
}

static PATTERNS: [&str; 6] = [
    "ttyUSB",
    "ttyACM",
    "tty.usbserial",
    "cu.usbserial",
    "tty.SLAB_USB",
    "cu.SLAB_USB",
];

fn find_most_recent_tty() -> Option<PathBuf> {
    let dev = match std::fs::read_dir("/dev") {
        Ok(dev) => dev,
        Err(e) => {
            tracing::error!("failed to open /dev: {e}");
            return None;
        }
    };
    dev.filter_map(|entry| -> Option<(DirEntry, std::fs::Metadata)> {
        let entry = entry.ok()?;
        if !entry.file_type().ok()?.is_char_device() {
            return None;
        }
        let path = entry.path();
        let file_name = path.file_name()?;
        let matches_pattern = PATTERNS.iter().any(|pattern| {
            std::str::from_utf8(file_name.as_bytes())
                .map(|f| f.starts_with(pattern))
                .unwrap_or(false)
        });
        if !matches_pattern {
            return None;
        }
        let metadata = entry.metadata().ok()?;
        Some((entry, metadata))
    })
    .max_by_key(|(_, m)| m.modified().expect("Metadata::modified() not available"))
    .map(|(e, _)| e.path())
}

#[derive(clap::Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Serial device to upload through; will try to autodetect if not
    /// specified
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    /// Baud rate for the serial link
    #[arg(short, long, default_value_t = multiboot_common::BAUD_RATE)]
    pub baud: u32,

    /// Increase message verbosity
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Silence all output
    #[arg(short, long)]
    pub quiet: bool,

    /// Multiboot ROM image to upload
    #[arg(required = true)]
    pub rom_file: PathBuf,
}
