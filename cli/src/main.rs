mod target;

use anyhow::{anyhow, bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use log::{debug, info};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use target::ImageFileManager;
use winstick_core::{BlockDevice, Device, DeviceManager, Phase, ProgressEvent, SessionConfig};
use winstick_media::inject::CONFIG_PATH;
use winstick_media::partition::PartitionKind;
use winstick_media::{
    read_table, spawn_session, BootConfig, DriverCatalog, Fat32Reader, Outcome, PartitionTable,
    SourceImage,
};
use winstick_platform::{FileBlockDevice, PlatformDeviceManager, UsbDeviceManager};

#[derive(Parser)]
#[command(name = "winstick")]
#[command(about = "Write Windows installer images to USB drives that boot on BIOS and UEFI", long_about = None)]
struct Cli {
    /// Log more (-v for debug, -vv for trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List block devices and whether they may be written
    List {
        /// List USB mass-storage devices reachable over the bulk-only transport
        #[arg(long)]
        usb: bool,
    },
    /// Write an installer image to a device
    Write {
        /// NTFS installer image: a bare volume or a disk image holding one
        image: PathBuf,
        /// Device identifier or name; a file path with --to-file
        device: String,
        /// Boot mode (bios, uefi, hybrid); overrides the config file
        #[arg(short, long)]
        mode: Option<String>,
        /// Session config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory holding the driver catalog manifest.json
        #[arg(long)]
        driver_dir: Option<PathBuf>,
        /// Permit fixed disks; system disks are refused regardless
        #[arg(long)]
        allow_non_removable: bool,
        /// Write into an existing disk image file instead of a device
        #[arg(long, conflicts_with = "usb")]
        to_file: bool,
        /// Drive a USB stick directly over the bulk-only transport
        #[arg(long)]
        usb: bool,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Print the partition table and boot files of a device or image file
    Inspect {
        /// Device identifier or name, or an image file path
        target: String,
        /// Look the target up among USB mass-storage devices
        #[arg(long)]
        usb: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::List { usb } => list(usb).await,
        Commands::Write {
            image,
            device,
            mode,
            config,
            driver_dir,
            allow_non_removable,
            to_file,
            usb,
            yes,
        } => {
            let mut session_config = load_config(config.as_deref())?;
            if let Some(mode) = mode {
                session_config.boot_mode = mode.parse().map_err(|e: String| anyhow!(e))?;
            }
            if allow_non_removable {
                session_config.allow_non_removable = true;
            }
            session_config.validate()?;
            let catalog = load_catalog(driver_dir.as_deref())?;
            let target = if to_file {
                Target::File
            } else if usb {
                Target::Usb
            } else {
                Target::Device
            };
            write(&image, &device, target, yes, session_config, catalog).await
        }
        Commands::Inspect { target, usb } => inspect(&target, usb).await,
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SessionConfig> {
    if let Some(path) = path {
        return SessionConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()));
    }
    match SessionConfig::default_path() {
        Some(path) if path.is_file() => {
            info!("Using config {}", path.display());
            SessionConfig::load(&path).with_context(|| format!("reading config {}", path.display()))
        }
        _ => Ok(SessionConfig::default()),
    }
}

fn load_catalog(dir: Option<&Path>) -> anyhow::Result<DriverCatalog> {
    if let Some(dir) = dir {
        return DriverCatalog::load_dir(dir)
            .with_context(|| format!("loading driver catalog from {}", dir.display()));
    }
    bundled_catalog()
}

#[cfg(feature = "embedded-drivers")]
fn bundled_catalog() -> anyhow::Result<DriverCatalog> {
    Ok(DriverCatalog::builtin()?)
}

#[cfg(not(feature = "embedded-drivers"))]
fn bundled_catalog() -> anyhow::Result<DriverCatalog> {
    bail!("no driver catalog bundled with this build; pass --driver-dir")
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / 1_073_741_824.0
}

fn size_text(bytes: u64) -> String {
    if bytes == 0 {
        "unknown until opened".to_string()
    } else {
        format!("{:.2} GB", gib(bytes))
    }
}

/// Where `write` sends the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Device,
    Usb,
    File,
}

fn device_manager(usb: bool) -> Arc<dyn DeviceManager> {
    if usb {
        Arc::new(UsbDeviceManager)
    } else {
        Arc::new(PlatformDeviceManager)
    }
}

async fn list(usb: bool) -> anyhow::Result<()> {
    let manager = device_manager(usb);
    let devices = manager.enumerate_devices().await?;
    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }
    println!("Available devices:\n");
    for device in devices {
        println!("Device: {}", device.name);
        println!("  Path: {}", device.id);
        println!("  Size: {}", size_text(device.size));
        println!("  Type: {:?}", device.device_type);
        println!("  Removable: {}", if device.is_removable { "Yes" } else { "No" });
        match device.refusal(false) {
            None => println!("  Writable: Yes"),
            Some(reason) => println!("  Writable: No ({})", reason),
        }
        if !device.mount_points.is_empty() {
            println!("  Mounted at: {:?}", device.mount_points);
        }
        println!();
    }
    Ok(())
}

async fn find_device(manager: &dyn DeviceManager, wanted: &str) -> anyhow::Result<Device> {
    let devices = manager.enumerate_devices().await?;
    devices
        .iter()
        .find(|d| d.id == wanted)
        .or_else(|| devices.iter().find(|d| d.name.contains(wanted)))
        .cloned()
        .ok_or_else(|| anyhow!("Device not found: {}", wanted))
}

fn confirm(device: &Device) -> anyhow::Result<bool> {
    println!("\nWARNING: This will ERASE ALL DATA on {}!", device.name);
    print!("Type 'yes' to continue: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim() == "yes")
}

async fn write(
    image_path: &Path,
    target: &str,
    kind: Target,
    yes: bool,
    config: SessionConfig,
    catalog: DriverCatalog,
) -> anyhow::Result<()> {
    let image = SourceImage::open(image_path)
        .with_context(|| format!("reading installer image {}", image_path.display()))?;
    println!(
        "Source: {} ({} entries, {:.2} GB volume)",
        image.container(),
        image.manifest().len(),
        gib(image.volume_len())
    );

    let (manager, device): (Arc<dyn DeviceManager>, Device) = if kind == Target::File {
        let manager = ImageFileManager::new(Path::new(target))?;
        let device = manager.device().clone();
        (Arc::new(manager), device)
    } else {
        let manager = device_manager(kind == Target::Usb);
        let device = find_device(manager.as_ref(), target).await?;
        (manager, device)
    };
    if let Some(refusal) = device.refusal(config.allow_non_removable) {
        bail!("{}", refusal);
    }

    println!("Target device: {}", device.name);
    println!("  Size: {}", size_text(device.size));
    println!("  Type: {:?}", device.device_type);
    println!("  Boot mode: {}", config.boot_mode);
    if !yes && !confirm(&device)? {
        println!("Write cancelled.");
        return Ok(());
    }

    let mode = config.boot_mode;
    let mut handle = spawn_session(manager, device.clone(), image, config, Arc::new(catalog));
    let cancel = handle.cancel.clone();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut display = ProgressDisplay::default();

    loop {
        tokio::select! {
            event = handle.progress.recv() => match event {
                Some(event) => display.show(&event),
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                eprintln!("\nCancelling at the next batch boundary...");
                cancel.cancel();
            }
        }
    }
    println!();

    let report = handle.join(&device.id, mode).await;
    debug!("Phases visited: {:?}", report.history);
    match &report.outcome {
        Outcome::Completed => {
            println!(
                "Done: {} bytes written and verified on {}.",
                report.bytes_written, device.name
            );
            Ok(())
        }
        Outcome::RolledBack => {
            println!("Cancelled; the previous partition table was restored.");
            Ok(())
        }
        Outcome::Failed(failure) => bail!("{}", failure),
    }
}

#[derive(Default)]
struct ProgressDisplay {
    phase: Option<Phase>,
    tenths: u64,
}

impl ProgressDisplay {
    fn show(&mut self, event: &ProgressEvent) {
        if self.phase != Some(event.phase) {
            if self.phase.is_some() {
                println!();
            }
            print!("{}", event.phase);
            self.phase = Some(event.phase);
            self.tenths = u64::MAX;
        }
        if event.bytes_total > 0 {
            let tenths = (event.percent() * 10.0) as u64;
            if tenths != self.tenths {
                self.tenths = tenths;
                print!("\r{:<16}{:>6.1}%", event.phase.to_string(), event.percent());
            }
        }
        let _ = io::stdout().flush();
    }
}

async fn inspect(target: &str, usb: bool) -> anyhow::Result<()> {
    let path = Path::new(target);
    let is_file = !usb && path.is_file();
    let mut device: Box<dyn BlockDevice> = if is_file {
        Box::new(FileBlockDevice::open_image_read_only(path, 512)?)
    } else {
        let manager = device_manager(usb);
        let found = find_device(manager.as_ref(), target).await?;
        manager.open_read_only(&found)?
    };

    match read_table(device.as_mut()) {
        Ok(table) => print_table(device.as_mut(), &table),
        Err(err) if is_file => {
            debug!("No winstick partition table in {}: {}", target, err);
            drop(device);
            print_source(path)
        }
        Err(err) => Err(err.into()),
    }
}

fn print_table(device: &mut dyn BlockDevice, table: &PartitionTable) -> anyhow::Result<()> {
    let geometry = device.geometry();
    println!("Scheme: {}", table.scheme);
    println!("Disk signature: {:08X}", table.disk_signature);
    if let Some(guid) = table.disk_guid {
        println!("Disk GUID: {}", guid);
    }
    println!(
        "Sectors: {} x {} bytes ({:.2} GB)\n",
        geometry.total_sectors,
        geometry.sector_size,
        gib(geometry.size_bytes())
    );

    for (index, entry) in table.entries.iter().enumerate() {
        println!(
            "Partition {}: {:?}{}",
            index + 1,
            entry.kind,
            if entry.bootable { " (active)" } else { "" }
        );
        println!("  Sectors: {}..{}", entry.start_lba, entry.end_lba());
        println!(
            "  Size: {:.2} GB",
            gib(entry.sector_count * geometry.sector_size as u64)
        );
        if !entry.name.is_empty() {
            println!("  Name: {}", entry.name);
        }
        if let Some(guid) = entry.guid {
            println!("  GUID: {}", guid);
        }
        match entry.kind {
            PartitionKind::EfiSystem | PartitionKind::Fat32 => {
                print_boot_volume(device, entry.start_lba)?
            }
            PartitionKind::BasicData => {
                let sector = device.read_sectors(entry.start_lba, 1)?;
                let ntfs = &sector[3..11] == b"NTFS    ";
                println!("  Content: {}", if ntfs { "NTFS volume" } else { "unknown" });
            }
        }
        println!();
    }
    Ok(())
}

fn print_boot_volume(device: &mut dyn BlockDevice, start_lba: u64) -> anyhow::Result<()> {
    let mut reader = Fat32Reader::open(device, start_lba)?;
    let info = reader.boot_info().clone();
    println!("  FAT32 label: {}", info.label.trim_end());
    println!("  Volume ID: {:08X}", info.volume_id);
    match reader.stat(CONFIG_PATH)? {
        Some(_) => {
            let config = BootConfig::decode(&reader.read_file(CONFIG_PATH)?)?;
            println!(
                "  Boot driver: {} for {}, stage at LBA {}, target at LBA {}",
                config.variant, config.boot_mode, config.stage_lba, config.target_start_lba
            );
        }
        None => println!("  Boot driver: none"),
    }
    Ok(())
}

fn print_source(path: &Path) -> anyhow::Result<()> {
    let image = SourceImage::open(path)
        .with_context(|| format!("{} holds neither a partition table nor an NTFS volume", path.display()))?;
    println!("Installer image: {}", image.container());
    println!("  Volume: {:.2} GB, serial {:016X}", gib(image.volume_len()), image.serial());
    let files: Vec<_> = image.manifest().iter().filter(|e| !e.is_dir).collect();
    let total: u64 = files.iter().map(|e| e.size).sum();
    println!("  Files: {} ({:.2} GB)", files.len(), gib(total));
    if let Some(largest) = files.iter().max_by_key(|e| e.size) {
        println!("  Largest: /{} ({} bytes)", largest.path_string(), largest.size);
    }
    Ok(())
}
