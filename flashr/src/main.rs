mod ui;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use flashr_core::device::format_size;
use flashr_core::{BlockDevice, Config, Engine, Error};
use log::debug;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "flashr")]
#[command(about = "Download, flash and verify single-board computer images", version)]
struct Cli {
    /// Configuration file (default: <config dir>/flashr/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List block devices
    List {
        /// Include system and non-removable disks
        #[arg(short, long)]
        all: bool,
    },
    /// Write an image (local file or URL) to a device
    Write {
        /// Image file or http(s) URL
        #[arg(required = true)]
        image: String,

        /// URL of a SHA-256 checksum file for a downloaded image
        #[arg(long)]
        sha_url: Option<String>,

        /// Target device; prompts when omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Download an image into the cache
    Download {
        url: String,

        #[arg(long)]
        sha_url: Option<String>,
    },
    /// Decompress an image into the cache
    Decompress { path: PathBuf },
    /// Inspect or empty the image cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Total size of cached images
    Size,
    /// Cached images, least recently used first
    List,
    /// Remove every cached image
    Clear,
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Downloads `url`, asking what to do when the checksum does not match.
fn download(engine: &Engine, url: &str, sha_url: Option<&str>) -> Result<PathBuf> {
    let handle = engine.download_image(url, sha_url)?;
    match ui::follow_download(engine, handle, "Download")? {
        Ok(path) => Ok(path),
        Err(Error::ChecksumMismatch { expected, actual }) => {
            println!(
                "{} checksum mismatch\n  expected {}\n  got      {}",
                style("WARNING:").red().bold(),
                expected,
                actual
            );
            if ui::confirm("Use the image anyway?")? {
                Ok(engine.continue_unverified(url)?)
            } else {
                engine.discard_unverified(url)?;
                Err(anyhow!("Download discarded."))
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn decompress_if_needed(engine: &Engine, path: &Path) -> Result<PathBuf> {
    if !engine.needs_decompression(path)? {
        return Ok(path.to_path_buf());
    }
    let handle = engine.decompress(path)?;
    Ok(ui::follow_download(engine, handle, "Decompress")??)
}

fn choose_device(engine: &Engine, requested: Option<PathBuf>) -> Result<BlockDevice> {
    let devices = engine.list_block_devices()?;
    match requested {
        Some(path) => devices
            .into_iter()
            .find(|d| d.path == path)
            .ok_or_else(|| Error::DeviceNotFound(path).into()),
        None => {
            let flashable: Vec<BlockDevice> =
                devices.into_iter().filter(BlockDevice::is_flashable).collect();
            ui::select_device(&flashable, "Select the target device to WRITE to")
        }
    }
}

fn write(
    engine: &Engine,
    source: &str,
    sha_url: Option<&str>,
    device: Option<PathBuf>,
    verify: bool,
    yes: bool,
) -> Result<()> {
    let image = if is_url(source) {
        download(engine, source, sha_url)?
    } else {
        PathBuf::from(source)
    };
    let image = decompress_if_needed(engine, &image)?;

    let device = choose_device(engine, device)?;
    if device.is_system {
        return Err(Error::SystemDevice(device.path).into());
    }

    println!(
        "{} This will erase all data on '{}' ({}).",
        style("WARNING:").red().bold(),
        device.model,
        device.size_formatted,
    );
    println!("  Device: {}", style(device.path.display()).cyan());
    println!("  Image:  {}", style(image.display()).cyan());
    println!();

    if !yes && !ui::confirm("Are you sure you want to proceed?")? {
        println!("Write operation cancelled.");
        return Ok(());
    }

    match engine.authorize_write(&device.path) {
        Ok(true) => {}
        Ok(false) => {
            println!("Authorization dismissed, nothing was written.");
            return Ok(());
        }
        Err(Error::RelaunchRequired) => {
            println!("{}", Error::RelaunchRequired);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let handle = engine.flash_image(&image, &device.path, verify)?;
    let summary = ui::follow_flash(engine, handle)??;
    debug!("Image sha256 {}", summary.sha256);

    println!(
        "\n✨ Successfully flashed {} with {}{}.",
        style(device.path.display()).cyan(),
        style(image.display()).cyan(),
        if summary.verified { " (verified)" } else { "" }
    );
    Ok(())
}

fn list(engine: &Engine, all: bool) -> Result<()> {
    let devices: Vec<BlockDevice> = engine
        .list_block_devices()?
        .into_iter()
        .filter(|d| all || d.is_flashable())
        .collect();
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} devices:", devices.len());
    println!(
        "\n  {:<20} {:<28} {:>10}  {:<8} {}",
        "DEVICE", "MODEL", "SIZE", "BUS", "FLAGS"
    );
    println!("  {:-<20} {:-<28} {:->10}  {:-<8} {:-<12}", "", "", "", "", "");
    for device in devices {
        let mut flags = Vec::new();
        if device.is_removable {
            flags.push("removable");
        }
        if device.is_system {
            flags.push("SYSTEM");
        }
        println!(
            "  {:<20} {:<28} {:>10}  {:<8} {}",
            device.path.display(),
            device.model,
            device.size_formatted,
            device.bus_type.to_string(),
            flags.join(",")
        );
    }
    Ok(())
}

fn cache(engine: &Engine, action: CacheCommand) -> Result<()> {
    match action {
        CacheCommand::Size => {
            let size = engine.get_cache_size()?;
            println!(
                "{} of {} used in {}",
                format_size(size),
                format_size(engine.config().cache.max_size),
                engine.cache_dir().display()
            );
        }
        CacheCommand::List => {
            let entries = engine.cache_entries()?;
            if entries.is_empty() {
                println!("The cache is empty.");
            }
            for entry in entries {
                println!("  {:>10}  {}", format_size(entry.size), entry.path.display());
            }
        }
        CacheCommand::Clear => {
            let removed = engine.clear_cache()?;
            println!("Removed {} files.", removed);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let _term_restorer = ui::TermRestorer::new();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);
    let verify_default = config.flash.verify;
    let engine = Engine::new(config)?;

    let canceller = engine.canceller();
    ctrlc::set_handler(move || {
        canceller.cancel();
    })?;

    match cli.command {
        Commands::List { all } => list(&engine, all),
        Commands::Write {
            image,
            sha_url,
            device,
            no_verify,
            yes,
        } => write(
            &engine,
            &image,
            sha_url.as_deref(),
            device,
            verify_default && !no_verify,
            yes,
        ),
        Commands::Download { url, sha_url } => {
            let path = download(&engine, &url, sha_url.as_deref())?;
            println!("Downloaded to {}", style(path.display()).cyan());
            Ok(())
        }
        Commands::Decompress { path } => {
            let output = decompress_if_needed(&engine, &path)?;
            println!("Image ready at {}", style(output.display()).cyan());
            Ok(())
        }
        Commands::Cache { action } => cache(&engine, action),
    }
}
