//! Library and application errors

use std::io;

use miette::Diagnostic;
use serde::Serialize;
use strum::Display;
use thiserror::Error;

/// All possible errors returned by arduflash
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(arduflash::port_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    PortNotFound(String),

    #[error("The serial port '{0}' is already in use")]
    #[diagnostic(
        code(arduflash::port_busy),
        help("Close any other serial monitor or upload tool holding the port and try again")
    )]
    PortBusy(String),

    #[error("Permission to open the serial port '{0}' was denied")]
    #[diagnostic(
        code(arduflash::port_denied),
        help("On Linux, add your user to the `dialout` group or adjust the udev rules")
    )]
    PortDenied(String),

    #[error("The serial port disappeared while it was in use")]
    #[diagnostic(
        code(arduflash::port_vanished),
        help("The device was unplugged or re-enumerated under a new path")
    )]
    PortVanished,

    #[error("Failed to synchronize with the bootloader")]
    #[diagnostic(
        code(arduflash::sync_failed),
        help("Check the selected board and baud rate, then reset the board and try again")
    )]
    SyncFailed,

    #[error("The bootloader port could not be identified automatically")]
    #[diagnostic(
        code(arduflash::bootloader_port_needed),
        help("Select the bootloader port explicitly; it appears only after the 1200-baud touch")
    )]
    BootloaderPortNeeded,

    #[error("The board on '{port}' ({vid:04x}:{pid:04x}) does not match the selected profile '{fqbn}'")]
    #[diagnostic(
        code(arduflash::board_mismatch),
        help("Pick the matching board, or confirm the mismatch to proceed anyway")
    )]
    BoardMismatch {
        port: String,
        vid: u16,
        pid: u16,
        fqbn: String,
    },

    #[error("The firmware artifact is invalid")]
    #[diagnostic(transparent)]
    Firmware(#[from] ParseError),

    #[error("Writing to the device failed")]
    #[diagnostic(code(arduflash::write_failed))]
    WriteFailed(#[source] io::Error),

    #[error("Timed out waiting for a response from the device")]
    #[diagnostic(
        code(arduflash::read_timeout),
        help("The bootloader stopped responding; reset the board and retry the upload")
    )]
    ReadTimeout,

    #[error("Verification of flash contents failed at address {address:#06x}")]
    #[diagnostic(code(arduflash::verify_failed))]
    VerifyFailed { address: u32 },

    #[error("Device signature {found:02x?} does not match the expected {expected:02x?}")]
    #[diagnostic(
        code(arduflash::signature_mismatch),
        help("The connected MCU is not the one the selected board profile programs")
    )]
    SignatureMismatch {
        expected: [u8; 3],
        found: [u8; 3],
    },

    #[error("An upload session is already running on '{0}'")]
    #[diagnostic(code(arduflash::session_in_progress))]
    SessionInProgress(String),

    #[error("Operation was cancelled")]
    #[diagnostic(code(arduflash::cancelled))]
    Cancelled,

    #[error("The '{0}' profile uses a mass-storage bootloader, which this host cannot export to")]
    #[diagnostic(
        code(arduflash::unsupported_strategy),
        help("Copy the UF2 artifact onto the board's bootloader drive manually")
    )]
    UnsupportedStrategy(String),

    #[error("Unknown board '{0}'")]
    #[diagnostic(
        code(arduflash::unknown_board),
        help("Run with `--list-boards` to see the supported FQBNs")
    )]
    UnknownBoard(String),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(arduflash::serial_error))]
    Serial(#[source] serialport::Error),

    #[error(transparent)]
    #[diagnostic(code(arduflash::io_error))]
    Io(#[from] io::Error),
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::NoDevice => Error::PortVanished,
            ErrorKind::Io(io::ErrorKind::NotFound) => Error::PortVanished,
            ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                Error::PortDenied(err.description.clone())
            }
            ErrorKind::Io(io::ErrorKind::TimedOut) => Error::ReadTimeout,
            _ => Error::Serial(err),
        }
    }
}

impl Error {
    /// Classify an error under the closed taxonomy surfaced in upload reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PortNotFound(_) => ErrorKind::PortNotFound,
            Error::PortBusy(_) => ErrorKind::PortBusy,
            Error::PortDenied(_) => ErrorKind::PortDenied,
            Error::PortVanished => ErrorKind::PortVanished,
            Error::SyncFailed => ErrorKind::SyncFailed,
            Error::BootloaderPortNeeded => ErrorKind::BootloaderPortNeeded,
            Error::BoardMismatch { .. } => ErrorKind::BoardMismatch,
            Error::Firmware(_) => ErrorKind::FirmwareInvalid,
            Error::WriteFailed(_) => ErrorKind::WriteFailed,
            Error::ReadTimeout => ErrorKind::ReadTimeout,
            Error::VerifyFailed { .. } => ErrorKind::VerifyFailed,
            Error::SignatureMismatch { .. } => ErrorKind::SignatureMismatch,
            Error::SessionInProgress(_) => ErrorKind::SessionInProgress,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::UnsupportedStrategy(_) => ErrorKind::UnsupportedStrategy,
            Error::UnknownBoard(_) | Error::Serial(_) | Error::Io(_) => ErrorKind::Other,
        }
    }
}

/// The closed error taxonomy carried by [`UploadReport`].
///
/// [`UploadReport`]: crate::uploader::UploadReport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[non_exhaustive]
pub enum ErrorKind {
    PortNotFound,
    PortBusy,
    PortDenied,
    PortVanished,
    SyncFailed,
    BootloaderPortNeeded,
    BoardMismatch,
    FirmwareInvalid,
    WriteFailed,
    ReadTimeout,
    VerifyFailed,
    SignatureMismatch,
    SessionInProgress,
    Cancelled,
    UnsupportedStrategy,
    Other,
}

impl ErrorKind {
    /// Process exit code for a failed upload, for callers wrapping the engine
    /// in a command-line tool.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::PortNotFound | ErrorKind::PortBusy => 3,
            ErrorKind::SyncFailed | ErrorKind::BootloaderPortNeeded => 4,
            ErrorKind::VerifyFailed => 5,
            ErrorKind::FirmwareInvalid => 6,
            ErrorKind::Cancelled => 7,
            _ => 1,
        }
    }
}

/// Errors produced while parsing a firmware artifact
#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("Intel HEX record on line {line} has an invalid checksum")]
    #[diagnostic(
        code(arduflash::firmware::invalid_checksum),
        help("The artifact is corrupt; rebuild or re-download it")
    )]
    InvalidChecksum { line: usize },

    #[error("Intel HEX record on line {line} has unsupported type {record_type:#04x}")]
    #[diagnostic(code(arduflash::firmware::unsupported_record))]
    UnsupportedRecord { line: usize, record_type: u8 },

    #[error("Intel HEX record on line {line} is malformed")]
    #[diagnostic(code(arduflash::firmware::malformed_record))]
    MalformedRecord { line: usize },

    #[error("Firmware segments overlap at address {address:#010x}")]
    #[diagnostic(code(arduflash::firmware::overlapping_segments))]
    OverlappingSegments { address: u32 },

    #[error("Firmware address {address:#010x} lies outside the board's flash range")]
    #[diagnostic(
        code(arduflash::firmware::out_of_range),
        help("The image was built for a different board or with a wrong linker script")
    )]
    OutOfRange { address: u32 },

    #[error("Firmware of {size} bytes does not fit the board's {flash_size} byte flash")]
    #[diagnostic(code(arduflash::firmware::too_big))]
    TooBig { size: usize, flash_size: u32 },

    #[error("The artifact is not a valid UF2 file")]
    #[diagnostic(code(arduflash::firmware::invalid_uf2))]
    InvalidUf2,

    #[error("The artifact is empty")]
    #[diagnostic(code(arduflash::firmware::empty))]
    Empty,
}

/// Shorthand used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
