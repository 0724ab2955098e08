//! Exclusive, typed access to a single serial endpoint
//!
//! [SerialTransport] owns one native serial port for the duration of an
//! upload phase. The [SerialLink] trait captures the byte-level contract the
//! upload strategies program against, so that protocol drivers can be tested
//! against a scripted endpoint instead of hardware.

use std::{
    collections::HashSet,
    io::{Read, Write},
    sync::Mutex,
    thread::sleep,
    time::{Duration, Instant},
};

use log::debug;
use serialport::SerialPort;

use crate::{
    error::{Error, Result},
    ports::PortInfo,
};

pub mod reset;

#[cfg(unix)]
pub type Port = serialport::TTYPort;
#[cfg(windows)]
pub type Port = serialport::COMPort;

/// Write deadline applied to every outgoing transfer.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Settle time between close and reopen, so USB-CDC bridges see a fresh
/// `SET_LINE_CODING` on the next open.
const REOPEN_DELAY: Duration = Duration::from_millis(100);
/// How long the 1200-baud touch holds DTR low.
const TOUCH_HOLD: Duration = Duration::from_millis(500);
/// Transient-failure retries while a freshly enumerated port settles.
const MAX_OPEN_RETRIES: u32 = 5;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

// One open handle per device path, process-wide. Ownership of a port is
// expressed by holding the claim, not by a lock around I/O.
static CLAIMED_PORTS: Mutex<Option<HashSet<String>>> = Mutex::new(None);

fn claim(name: &str) -> Result<()> {
    let mut claimed = CLAIMED_PORTS.lock().unwrap();
    let claimed = claimed.get_or_insert_with(HashSet::new);
    if !claimed.insert(name.to_string()) {
        return Err(Error::PortBusy(name.to_string()));
    }
    Ok(())
}

fn release(name: &str) {
    let mut claimed = CLAIMED_PORTS.lock().unwrap();
    if let Some(claimed) = claimed.as_mut() {
        claimed.remove(name);
    }
}

/// Byte-level contract between a strategy and its serial endpoint
pub trait SerialLink {
    /// Write all of `bytes`, subject to the transport's write deadline.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read whatever arrives within `timeout`. Never returns `Ok` with zero
    /// bytes; an empty wait is a [`Error::ReadTimeout`].
    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Accumulate exactly `n` bytes or fail with [`Error::ReadTimeout`].
    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(n);
        let mut buf = [0u8; 256];

        while out.len() < n {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::ReadTimeout)?;
            let want = (n - out.len()).min(buf.len());
            let got = self.read_some(&mut buf[..want], remaining)?;
            out.extend_from_slice(&buf[..got]);
        }

        Ok(out)
    }

    /// Read until `delim` is seen (inclusive) or `timeout` elapses.
    fn read_until(&mut self, delim: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();

        loop {
            if out.ends_with(delim) {
                return Ok(out);
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::ReadTimeout)?;
            let mut byte = [0u8; 1];
            self.read_some(&mut byte, remaining)?;
            out.push(byte[0]);
        }
    }

    /// Set DTR and RTS. Maps to the USB-CDC `SET_CONTROL_LINE_STATE` bitmap
    /// (bit 0 DTR, bit 1 RTS).
    fn set_lines(&mut self, dtr: bool, rts: bool) -> Result<()>;

    /// Close, wait for the CDC bridge to settle, reopen at `baud` and
    /// re-assert DTR+RTS. Needed where a bridge only emits the new
    /// `SET_LINE_CODING` on a fresh open.
    fn reopen_at(&mut self, baud: u32) -> Result<()>;

    /// Drop any unread input.
    fn clear_input(&mut self) -> Result<()>;

    /// The baud rate currently negotiated.
    fn baud(&self) -> u32;
}

/// An exclusively owned native serial port
#[derive(Debug)]
pub struct SerialTransport {
    port: Option<Port>,
    info: PortInfo,
    baud: u32,
    claimed: bool,
}

impl SerialTransport {
    /// Open the port at `baud` with DTR and RTS asserted.
    pub fn open(info: &PortInfo, baud: u32) -> Result<Self> {
        claim(&info.name)?;
        match open_native(&info.name, baud) {
            Ok(port) => {
                let mut transport = SerialTransport {
                    port: Some(port),
                    info: info.clone(),
                    baud,
                    claimed: true,
                };
                transport.set_lines(true, true)?;
                Ok(transport)
            }
            Err(err) => {
                release(&info.name);
                Err(err)
            }
        }
    }

    /// Close the port, lowering DTR and RTS first. Idempotent. The claim is
    /// dropped even when a failed reopen already lost the native handle.
    pub fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            let _ = port.write_data_terminal_ready(false);
            let _ = port.write_request_to_send(false);
            drop(port);
            debug!("closed {}", self.info.name);
        }
        if self.claimed {
            release(&self.info.name);
            self.claimed = false;
        }
    }

    /// The endpoint this transport owns.
    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    /// Perform the 1200-baud touch on `info`, resetting a native-USB board
    /// into its bootloader: open at 1200 baud, re-issue the line coding,
    /// drop DTR while keeping RTS, hold, close.
    pub fn touch_1200(info: &PortInfo) -> Result<()> {
        debug!("1200-baud touch on {}", info.name);
        claim(&info.name)?;
        let result = (|| -> Result<()> {
            let mut port = open_native(&info.name, 1200)?;
            port.write_data_terminal_ready(true)?;
            port.write_request_to_send(true)?;
            // Some CDC bridges act only on a repeated SET_LINE_CODING.
            port.set_baud_rate(1200)?;
            sleep(Duration::from_millis(50));
            port.write_data_terminal_ready(false)?;
            sleep(TOUCH_HOLD);
            Ok(())
        })();
        release(&info.name);
        result
    }

    fn port_mut(&mut self) -> Result<&mut Port> {
        self.port.as_mut().ok_or(Error::PortVanished)
    }
}

fn open_native(name: &str, baud: u32) -> Result<Port> {
    let mut last_err = None;

    for attempt in 0..MAX_OPEN_RETRIES {
        match serialport::new(name, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(WRITE_TIMEOUT)
            .open_native()
        {
            Ok(port) => {
                if attempt > 0 {
                    debug!("{name} opened after {attempt} retries");
                }
                return Ok(port);
            }
            Err(err) => {
                // A port that is mid re-enumeration reports spurious busy or
                // IO failures for a few hundred milliseconds.
                let transient = !matches!(
                    err.kind(),
                    serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied)
                );
                last_err = Some(err);
                if transient && attempt + 1 < MAX_OPEN_RETRIES {
                    sleep(OPEN_RETRY_DELAY);
                    continue;
                }
                break;
            }
        }
    }

    let err = last_err.expect("open attempted at least once");
    Err(match err.kind() {
        serialport::ErrorKind::NoDevice => Error::PortNotFound(name.to_string()),
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            Error::PortNotFound(name.to_string())
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            Error::PortDenied(name.to_string())
        }
        _ if err.to_string().to_lowercase().contains("busy")
            || err.to_string().to_lowercase().contains("in use") =>
        {
            Error::PortBusy(name.to_string())
        }
        _ => Error::Serial(err),
    })
}

impl SerialLink for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        port.write_all(bytes).map_err(map_write_err)?;
        port.flush().map_err(map_write_err)?;
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port_mut()?;
        port.set_timeout(timeout).map_err(Error::from)?;

        match port.read(buf) {
            Ok(0) => Err(Error::ReadTimeout),
            Ok(n) => Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Err(Error::ReadTimeout),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => Err(Error::ReadTimeout),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(Error::PortVanished),
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Err(Error::PortVanished),
            Err(err) => Err(Error::Io(err)),
        }
    }

    fn set_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        let port = self.port_mut()?;
        set_lines_impl(port, dtr, rts)
    }

    fn reopen_at(&mut self, baud: u32) -> Result<()> {
        debug!("reopening {} at {baud} baud", self.info.name);
        if let Some(port) = self.port.take() {
            drop(port);
        }
        sleep(REOPEN_DELAY);

        // The claim stays held across the gap so nobody steals the port.
        let port = open_native(&self.info.name, baud)?;
        self.port = Some(port);
        self.baud = baud;
        self.set_lines(true, true)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port_mut()?
            .clear(serialport::ClearBuffer::Input)
            .map_err(Error::from)
    }

    fn baud(&self) -> u32 {
        self.baud
    }
}

#[cfg(unix)]
fn set_lines_impl(port: &mut Port, dtr: bool, rts: bool) -> Result<()> {
    use std::os::fd::AsRawFd;

    // Set both lines in one ioctl so the device never observes an
    // intermediate combination.
    let fd = port.as_raw_fd();
    let mut status: i32 = 0;
    if unsafe { libc::ioctl(fd, libc::TIOCMGET, &mut status) } != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    if dtr {
        status |= libc::TIOCM_DTR;
    } else {
        status &= !libc::TIOCM_DTR;
    }
    if rts {
        status |= libc::TIOCM_RTS;
    } else {
        status &= !libc::TIOCM_RTS;
    }

    if unsafe { libc::ioctl(fd, libc::TIOCMSET, &status) } != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(windows)]
fn set_lines_impl(port: &mut Port, dtr: bool, rts: bool) -> Result<()> {
    port.write_data_terminal_ready(dtr)?;
    port.write_request_to_send(rts)?;
    Ok(())
}

fn map_write_err(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::TimedOut => Error::WriteFailed(err),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::BrokenPipe => Error::PortVanished,
        _ => Error::WriteFailed(err),
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn second_claim_on_same_path_is_busy() {
        claim("/dev/ttyTEST0").unwrap();
        let err = claim("/dev/ttyTEST0").unwrap_err();
        assert!(matches!(err, Error::PortBusy(_)));

        release("/dev/ttyTEST0");
        claim("/dev/ttyTEST0").unwrap();
        release("/dev/ttyTEST0");
    }

    #[test]
    fn release_is_idempotent() {
        release("/dev/ttyNEVER");
        release("/dev/ttyNEVER");
    }
}
