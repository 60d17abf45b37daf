use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use stm32_uart_prog::{
    fleet::parse_target_spec, Error, FleetConfig, FleetDriver, HexImage, ManualHooks,
    McuDescriptor, SerialTransport, DEFAULT_BAUDRATE,
};

const EXIT_OK: u8 = 0;
const EXIT_TARGET_FAILED: u8 = 1;
const EXIT_BAD_ARGS: u8 = 2;
const EXIT_TRANSPORT: u8 = 3;
const EXIT_CANCELLED: u8 = 130;

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    /// Intel HEX firmware image
    #[arg(long)]
    hexfile: String,

    /// Targets to program, e.g. "1,3-5,8"
    #[arg(long)]
    targets: String,

    /// Serial port
    #[arg(short, long, default_value_t = String::from("/dev/ttyUSB0"))]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUDRATE)]
    baud: u32,

    /// Jump to the application after programming
    #[arg(long, conflicts_with = "no_go")]
    go: bool,

    /// Leave the targets in the bootloader after programming (default)
    #[arg(long)]
    no_go: bool,

    /// Low-level retries per bootloader command
    #[arg(long, default_value_t = 3)]
    retries_cmd: u32,

    /// Write/verify attempts per chunk
    #[arg(long, default_value_t = 3)]
    retries_chunk: u32,

    /// Recovery passes per sector
    #[arg(long, default_value_t = 2)]
    retries_sector: u32,

    /// Erase attempts per sector
    #[arg(long, default_value_t = 3)]
    retries_erase: u32,

    /// Bus-idle delay between targets, in milliseconds
    #[arg(long, default_value_t = 50)]
    inter_target_delay_ms: u64,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Opt::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn run(cli: Opt) -> anyhow::Result<u8> {
    let targets = parse_target_spec(&cli.targets)?;
    let descriptor = McuDescriptor::stm32f40x();
    let image = HexImage::from_hex_file(&cli.hexfile, descriptor.flash_lo, descriptor.flash_hi)
        .context("Failed to load firmware image")?;
    match image.extent() {
        Some((lo, hi)) => info!(
            "image: {} bytes in 0x{lo:08X}..=0x{hi:08X} for {} targets on {}",
            image.len(),
            targets.len(),
            descriptor
        ),
        None => info!("image is empty"),
    }

    let transport = SerialTransport::open(&cli.port, cli.baud)
        .context("Failed to open serialport device")?;

    let mut config = FleetConfig::default();
    config.session.go_after = cli.go && !cli.no_go;
    config.session.limits.command = cli.retries_cmd;
    config.session.limits.chunk = cli.retries_chunk;
    config.session.limits.sector_recover = cli.retries_sector;
    config.session.limits.erase = cli.retries_erase;
    config.inter_target_delay = Duration::from_millis(cli.inter_target_delay_ms);

    let mut driver = FleetDriver::new(transport, ManualHooks::default(), config);
    let report = driver.run(&targets, &image, &descriptor)?;
    report.log_summary();

    if report.cancelled {
        return Ok(EXIT_CANCELLED);
    }
    if report.all_done() {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_TARGET_FAILED)
    }
}

/// Maps setup failures onto the documented exit codes.
///
/// Walks the whole cause chain: `.context()` boxes the typed error one
/// level down, so a bare downcast of the outermost error would miss it.
fn exit_code_for(e: &anyhow::Error) -> u8 {
    let kind = e.chain().find_map(|cause| cause.downcast_ref::<Error>());
    match kind {
        Some(Error::TargetSpec(_)) | Some(Error::Image(_)) | Some(Error::Plan(_)) => EXIT_BAD_ARGS,
        Some(Error::Cancelled) => EXIT_CANCELLED,
        Some(_) | None => EXIT_TRANSPORT,
    }
}
