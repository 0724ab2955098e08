//! CLI utilities for the arduflash binary
//!
//! No stability guarantees apply.

use std::{
    fs,
    io::{stdout, Write},
    path::PathBuf,
    time::Duration,
};

use clap::Args;
use crossterm::{
    event::{poll, read, Event, KeyCode, KeyEventKind, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use miette::{IntoDiagnostic, Result, WrapErr};

use crate::{
    boards::{self, Profile},
    error::Error,
    image::FormatHint,
    monitor::MonitorCoupler,
    ports::{self, PortInfo},
    progress::ProgressCallbacks,
    uploader::{HostCapabilities, UploadReport, UploadRequest, Uploader},
};

pub mod config;

mod serial;

pub use serial::select_port;

#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port connected to the target board
    #[arg(short = 'p', long)]
    pub port: Option<String>,
    /// Always ask for confirmation before using a detected port
    #[arg(long)]
    pub confirm_port: bool,
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// Firmware artifact to upload (.hex, .bin or .uf2)
    pub image: PathBuf,
    /// Fully qualified board name, e.g. `arduino:avr:uno`
    #[arg(short = 'b', long, env = "ARDUFLASH_FQBN")]
    pub fqbn: String,
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Open the serial monitor after a successful upload
    #[arg(short = 'M', long)]
    pub monitor: bool,
    /// Baud rate for the serial monitor after the upload
    #[arg(long)]
    pub monitor_baud: Option<u32>,
    /// Resolve the profile and parse the image without touching a port
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Baud rate at which to read sketch output
    #[arg(long, default_value = "115200")]
    pub baud: u32,
}

/// Progress bar shown while pages land on the board.
#[derive(Default)]
pub struct ArduflashProgress {
    bar: Option<ProgressBar>,
}

impl ProgressCallbacks for ArduflashProgress {
    fn started(&mut self, address: u32, total_pages: usize) {
        let bar = ProgressBar::new(total_pages as u64);
        bar.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos:>4}/{len:4} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message(format!("@ {address:#010x}"));
        self.bar = Some(bar);
    }

    fn page_done(&mut self, pages_done: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(pages_done as u64);
        }
    }

    fn completed(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

/// Interactive answers to the engine's capability requests.
pub struct InteractiveHost;

impl HostCapabilities for InteractiveHost {
    fn pick_bootloader_port(&mut self, candidates: &[PortInfo]) -> Option<PortInfo> {
        let labels: Vec<String> = candidates
            .iter()
            .map(|port| match &port.product {
                Some(product) => format!("{} - {}", port.name, product),
                None => port.name.clone(),
            })
            .collect();

        info!("Several bootloader ports appeared, pick the right one");
        let index = Select::with_theme(&ColorfulTheme::default())
            .items(&labels)
            .default(0)
            .interact_opt()
            .ok()??;

        candidates.get(index).cloned()
    }

    fn confirm_board_mismatch(&mut self, port: &PortInfo, fqbn: &str) -> bool {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "'{}' reports {:04x}:{:04x}, which is not a {fqbn}. Upload anyway?",
                port.name, port.vid, port.pid
            ))
            .interact_opt()
            .unwrap_or_default()
            .unwrap_or_default()
    }

    fn export_artifact(&mut self, suggested_name: &str, data: &[u8]) -> Result<bool, Error> {
        fs::write(suggested_name, data)?;
        Ok(true)
    }
}

/// Run one upload, then optionally stay attached as a monitor. Returns the
/// process exit code.
pub fn upload(args: UploadArgs, config: &config::Config) -> Result<i32> {
    let profile = boards::profile_for_fqbn(&args.fqbn)
        .ok_or_else(|| Error::UnknownBoard(args.fqbn.clone()))?;

    let firmware = fs::read(&args.image)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read {}", args.image.display()))?;
    let hint = hint_from_path(&args.image);

    if args.dry_run {
        return dry_run(profile, &args.fqbn, &firmware, hint);
    }

    let port = select_port(&args.connect, config, profile.app_vidpid)?;
    println!("Serial port: {}", port.name);
    println!("Board:       {}", profile.family);

    let request = UploadRequest {
        profile,
        fqbn: args.fqbn.clone(),
        firmware,
        format_hint: hint,
        port: port.clone(),
        monitor_baud: args.monitor_baud,
        last_working_baud: config.monitor_baud,
    };

    let mut caps = InteractiveHost;
    let mut progress = ArduflashProgress::default();
    let mut uploader = Uploader::new(&mut caps, &mut progress);

    let cancel = uploader.cancel_token();
    ctrlc::set_handler(move || cancel.cancel())
        .into_diagnostic()
        .wrap_err("Failed to install the Ctrl-C handler")?;

    let mut coupler = MonitorCoupler::new();
    let report = uploader.run(request, &mut coupler);
    print_report(&report);

    if report.success() {
        if let Err(err) = config.save_with(|config| config.monitor_baud = Some(report.monitor_baud))
        {
            warn!("could not remember the monitor baud: {err:#}");
        }
        if args.monitor {
            return monitor_loop(&mut coupler, &port, report.monitor_baud).map(|()| 0);
        }
    }

    Ok(report.error_kind().map_or(0, |kind| kind.exit_code()))
}

fn dry_run(
    profile: &'static Profile,
    fqbn: &str,
    firmware: &[u8],
    hint: FormatHint,
) -> Result<i32> {
    use crate::image::FirmwareImage;

    let image = FirmwareImage::parse(firmware, hint, profile.flash_layout())
        .map_err(Error::from)?;

    println!("Board:      {fqbn} ({})", profile.family);
    println!("Strategy:   {}", profile.strategy);
    println!("Format:     {}", image.format());
    println!("Image:      {} bytes at {:#010x}", image.total_bytes(), image.start_address());
    println!(
        "Pages:      {} x {} bytes",
        image.linear_image().len() as u32 / profile.page_size,
        profile.page_size
    );
    println!("Baud:       {}", profile.program_baud);

    Ok(0)
}

fn print_report(report: &UploadReport) {
    if report.success() {
        println!(
            "\nUpload complete: {} bytes in {} pages ({:.1?})",
            report.bytes_written, report.pages_written, report.duration
        );
        if let Some(version) = &report.bootloader_version {
            println!("Bootloader: {version}");
        }
    } else {
        error!(
            "upload failed: {:?}",
            report.error_kind().map(|kind| kind.to_string())
        );
        for entry in &report.log {
            eprintln!("  [{}] {}", entry.severity, entry.message);
        }
    }
}

/// Open a serial monitor without uploading anything.
pub fn serial_monitor(args: MonitorArgs, config: &config::Config) -> Result<()> {
    let port = select_port(&args.connect, config, &[])?;
    let mut coupler = MonitorCoupler::new();
    monitor_loop(&mut coupler, &port, args.baud)
}

/// List USB serial ports.
pub fn list_ports() -> Result<()> {
    let ports = ports::list().map_err(Error::from)?;
    if ports.is_empty() {
        println!("No USB serial ports detected");
        return Ok(());
    }

    for port in ports {
        match port.product {
            Some(product) => println!(
                "{}  {:04x}:{:04x}  {}",
                port.name, port.vid, port.pid, product
            ),
            None => println!("{}  {:04x}:{:04x}", port.name, port.vid, port.pid),
        }
    }
    Ok(())
}

/// List the supported boards and their FQBNs.
pub fn list_boards() -> Result<()> {
    for (fqbn, profile) in boards::all_profiles() {
        println!("{fqbn:32} {} ({})", profile.family, profile.strategy);
    }
    Ok(())
}

/// Type that ensures that raw mode is disabled when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        enable_raw_mode().into_diagnostic()?;
        Ok(RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(err) = disable_raw_mode() {
            error!("Failed to disable raw mode: {err:#}");
        }
    }
}

fn monitor_loop(coupler: &mut MonitorCoupler, port: &PortInfo, baud: u32) -> Result<()> {
    println!("Commands:");
    println!("    CTRL+C    Exit");
    println!();

    coupler
        .resume(baud, port)
        .map_err(|err| miette::Report::new(err))?;

    let _raw_mode = RawModeGuard::new()?;
    let mut out = stdout();

    loop {
        if let Some(chunk) = coupler
            .read_chunk(Duration::from_millis(5))
            .map_err(miette::Report::new)?
        {
            out.write_all(&chunk).into_diagnostic()?;
            out.flush().into_diagnostic()?;
        }

        if !forward_user_input(coupler)? {
            break;
        }
    }

    Ok(())
}

/// Returns `false` when the user asked to leave the monitor.
fn forward_user_input(coupler: &mut MonitorCoupler) -> Result<bool> {
    if !poll(Duration::ZERO).into_diagnostic()? {
        return Ok(true);
    }
    let Event::Key(key) = read().into_diagnostic()? else {
        return Ok(true);
    };
    if key.kind != KeyEventKind::Press {
        return Ok(true);
    }

    if key.modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char('c') = key.code {
            return Ok(false);
        }
    }

    let mut buf = [0u8; 4];
    let bytes: Option<&[u8]> = match key.code {
        KeyCode::Backspace => Some(b"\x08"),
        KeyCode::Enter => Some(b"\r"),
        KeyCode::Tab => Some(b"\x09"),
        KeyCode::Esc => Some(b"\x1b"),
        KeyCode::Up => Some(b"\x1b[A"),
        KeyCode::Down => Some(b"\x1b[B"),
        KeyCode::Right => Some(b"\x1b[C"),
        KeyCode::Left => Some(b"\x1b[D"),
        KeyCode::Char(ch) => {
            if key.modifiers.contains(KeyModifiers::CONTROL) && ch.is_ascii_lowercase() {
                buf[0] = ch as u8 & 0x1F;
                Some(&buf[..1])
            } else {
                Some(ch.encode_utf8(&mut buf).as_bytes())
            }
        }
        _ => None,
    };

    if let Some(bytes) = bytes {
        coupler.write(bytes).map_err(miette::Report::new)?;
    }
    Ok(true)
}

fn hint_from_path(path: &std::path::Path) -> FormatHint {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("hex") | Some("ihex") => FormatHint::IntelHex,
        Some("bin") => FormatHint::RawBinary,
        Some("uf2") => FormatHint::Uf2,
        _ => FormatHint::Auto,
    }
}
