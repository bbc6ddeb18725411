use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hidiap_core::{
    ByteImage, LogLevel, NusbTransport, SessionConfig, TransferEvent, TransferObserver,
    TransferSession,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "HID IAP firmware update tool (Pure Rust)", long_about = None)]
struct Args {
    /// USB vendor id (hex, e.g. 3151)
    #[arg(long, value_parser = parse_hex_u16, global = true)]
    vid: Option<u16>,

    /// USB product id (hex, e.g. 4015)
    #[arg(long, value_parser = parse_hex_u16, global = true)]
    pid: Option<u16>,

    /// HID interface to claim (skips the report descriptor scan)
    #[arg(long, global = true)]
    interface: Option<u8>,

    /// Session config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Switch the device into its IAP loader
    EnterIap,
    /// Send firmware to a device already in IAP mode
    Flash {
        /// Firmware image
        file: PathBuf,
    },
    /// Enter IAP, wait for the device to come back, then send firmware
    Upgrade {
        /// Firmware image
        file: PathBuf,
    },
    /// Send a bulk data image
    Bulk {
        /// Data image
        file: PathBuf,
    },
    /// Write a default config file
    ConfigTemplate {
        /// Output path
        path: PathBuf,
    },
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{}': {}", s, e))
}

/// Prints progress and log lines to stdout.
struct ConsoleObserver;

impl TransferObserver for ConsoleObserver {
    fn on_event(&self, event: &TransferEvent) {
        match event {
            TransferEvent::Progress {
                kind,
                current,
                total,
                percent,
            } => {
                if current == total || current % 25 == 0 {
                    println!("  {} {:>3}% ({}/{})", kind, percent, current, total);
                }
            }
            TransferEvent::Log(entry) => match entry.level {
                LogLevel::Success => println!("[OK]    {}", entry.message),
                LogLevel::Warn => println!("[WARN]  {}", entry.message),
                LogLevel::Error => println!("[ERROR] {}", entry.message),
                LogLevel::Info => {}
            },
            TransferEvent::StatusChanged { to, .. } => {
                println!("{}", to.message());
            }
            _ => {}
        }
    }
}

fn device_ids(args: &Args) -> Result<(u16, u16)> {
    let vid = args.vid.context("--vid is required for this command")?;
    let pid = args.pid.context("--pid is required for this command")?;
    Ok((vid, pid))
}

/// Apply interface and report settings to a located device.
fn configure(device: NusbTransport, args: &Args, config: &SessionConfig) -> NusbTransport {
    let device = device
        .with_report_id(config.report_id)
        .with_timeout(Duration::from_millis(config.report_timeout_ms));
    match args.interface {
        Some(number) => device.with_interface(number),
        None => device,
    }
}

fn open_device(args: &Args, config: &SessionConfig) -> Result<NusbTransport> {
    let (vid, pid) = device_ids(args)?;
    Ok(configure(NusbTransport::find(vid, pid)?, args, config))
}

fn default_log_level(verbose: bool) -> tracing::Level {
    // Session log lines already reach stdout through the console observer.
    if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    }
}

fn load_image(path: &PathBuf) -> Result<ByteImage> {
    let image = ByteImage::from_file(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    info!(path = %path.display(), len = image.len(), "Loaded image");
    Ok(image)
}

fn run(args: &Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    let reconnect_timeout = Duration::from_secs(config.reconnect_timeout_secs);
    let mut session = TransferSession::with_observer(config.clone(), Arc::new(ConsoleObserver));

    match &args.command {
        Command::ConfigTemplate { path } => {
            session.config().save_to_file(path)?;
            println!("Wrote {}", path.display());
            return Ok(());
        }
        Command::EnterIap => {
            session.connect(open_device(args, &config)?)?;
            session.enter_update_mode()?;
        }
        Command::Flash { file } => {
            let image = load_image(file)?;
            session.assume_iap_mode()?;
            session.connect(open_device(args, &config)?)?;
            session.transfer_firmware(&image)?;
        }
        Command::Upgrade { file } => {
            let (vid, pid) = device_ids(args)?;
            let image = load_image(file)?;
            session.connect(open_device(args, &config)?)?;
            session.enter_update_mode()?;

            // Give the device time to drop off the bus before polling.
            std::thread::sleep(Duration::from_secs(1));
            let device = NusbTransport::wait_for_device(vid, pid, reconnect_timeout)?;
            session.connect(configure(device, args, &config))?;
            session.transfer_firmware(&image)?;
        }
        Command::Bulk { file } => {
            let image = load_image(file)?;
            session.connect(open_device(args, &config)?)?;
            session.transfer_bulk(&image)?;
        }
    }

    session.disconnect()?;
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_log_level(args.verbose).into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting hidiap (nusb backend)...");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
