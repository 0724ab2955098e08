//! SAM-BA driver for native-USB boards (SAMD21 MKR family, Uno R4)
//!
//! The bootloader speaks an ASCII command set over USB-CDC: every command
//! ends with `#`, numeric fields are eight uppercase hex digits, and
//! line-oriented responses terminate with LF CR (in that order). Programming
//! stages each 4 KiB of image into SRAM, executes a small flashing applet,
//! and asks the bootloader to CRC the written range.
//!
//! Getting here at all requires the 1200-baud touch and a port
//! re-enumeration, which the orchestrator performs before `begin` runs.

use std::time::Duration;

use crc::{Crc, CRC_32_ISO_HDLC};
use log::debug;

use super::{ProgramStats, StrategyCtx, UploadStrategy, VerifyOutcome};
use crate::{
    boards::{Profile, VerifyPolicy},
    connection::SerialLink,
    error::{Error, Result},
    image::FirmwareImage,
    uploader::Severity,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const CHUNK_SIZE: usize = 4096;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);
const CHUNK_TIMEOUT: Duration = Duration::from_secs(3);
/// Reopen-and-retry cycles before the handshake is declared failed.
const MAX_HANDSHAKE_CYCLES: u32 = 3;
/// Line-oriented responses end LF CR, not CR LF.
const LINE_END: &[u8] = b"\n\r";

/// SRAM staging layout shared with the flashing applet. The parameter words
/// sit directly behind the applet code; the data buffer is page aligned
/// above it.
const APPLET_ADDR: u32 = 0x2000_1000;
const PARAM_DST: u32 = APPLET_ADDR + APPLET.len() as u32;
const PARAM_SRC: u32 = PARAM_DST + 4;
const PARAM_LEN: u32 = PARAM_SRC + 4;
const BUFFER_ADDR: u32 = 0x2000_2000;

/// Thumb flashing applet: copies `PARAM_LEN` bytes from `PARAM_SRC` to the
/// flash controller write buffer at `PARAM_DST`, page by page, then traps
/// back into the bootloader.
const APPLET: [u8; 52] = [
    0x09, 0x48, 0x0A, 0x49, 0x0A, 0x4A, 0x02, 0xE0, 0x08, 0xC9, 0x08, 0xC0, 0x01, 0x3A, 0x00,
    0x2A, 0xFA, 0xD1, 0x04, 0x48, 0x05, 0x49, 0x01, 0x60, 0x00, 0x68, 0x40, 0x07, 0xFC, 0xD4,
    0x00, 0xBE, 0xC0, 0x46, 0x00, 0x10, 0x00, 0x20, 0x00, 0x20, 0x00, 0x20, 0x00, 0x40, 0x00,
    0x41, 0x04, 0xA5, 0x00, 0x00, 0x44, 0x5A,
];

/// SAM-BA protocol driver
pub struct SamBa {
    program_baud: u32,
    post_upload_reset: bool,
    verify_policy: VerifyPolicy,
    applet_loaded: bool,
    version: Option<String>,
}

impl SamBa {
    pub fn new(profile: &Profile) -> Self {
        SamBa {
            program_baud: profile.program_baud,
            post_upload_reset: profile.post_upload_reset,
            verify_policy: profile.verify,
            applet_loaded: false,
            version: None,
        }
    }

    fn command(&self, link: &mut dyn SerialLink, command: &str) -> Result<()> {
        debug!("sam-ba: {command}");
        link.write_all(command.as_bytes())
    }

    /// `W<addr>,<value>#` writes one word of applet state.
    fn write_word(&self, link: &mut dyn SerialLink, address: u32, value: u32) -> Result<()> {
        self.command(link, &format!("W{address:08X},{value:08X}#"))
    }

    fn try_handshake(&mut self, ctx: &mut StrategyCtx<'_>) -> Result<()> {
        ctx.link.clear_input()?;

        // Select binary mode. The reply is the bare line terminator.
        ctx.link.write_all(b"N#")?;
        let reply = ctx.link.read_exact(2, HANDSHAKE_TIMEOUT)?;
        if reply != LINE_END {
            debug!("sam-ba N# answered {reply:02x?}");
            return Err(Error::SyncFailed);
        }
        Ok(())
    }
}

impl UploadStrategy for SamBa {
    fn begin(&mut self, ctx: &mut StrategyCtx<'_>) -> Result<()> {
        // A fresh close/reopen at the programming baud rate, even when the
        // port is already there: some CDC bridges only emit the second
        // SET_LINE_CODING on a new open, and the bootloader waits for it.
        ctx.link.reopen_at(self.program_baud)?;
        ctx.link.set_lines(true, true)?;

        let mut synced = false;
        for cycle in 0..MAX_HANDSHAKE_CYCLES {
            if cycle > 0 {
                ctx.link.reopen_at(self.program_baud)?;
            }
            match self.try_handshake(ctx) {
                Ok(()) => {
                    synced = true;
                    break;
                }
                Err(Error::ReadTimeout) | Err(Error::SyncFailed) => continue,
                Err(err) => return Err(err),
            }
        }
        if !synced {
            return Err(Error::SyncFailed);
        }

        self.command(ctx.link, "V#")?;
        let raw = ctx.link.read_until(LINE_END, HANDSHAKE_TIMEOUT)?;
        let version = String::from_utf8_lossy(&raw[..raw.len() - LINE_END.len()])
            .trim()
            .to_string();
        ctx.log
            .push(Severity::Info, format!("bootloader: {version}"));
        self.version = Some(version);

        // Device info is logged but never parsed strictly; older bootloader
        // revisions answer nothing at all.
        self.command(ctx.link, "I#")?;
        match ctx.link.read_until(LINE_END, HANDSHAKE_TIMEOUT) {
            Ok(raw) => {
                let info = String::from_utf8_lossy(&raw[..raw.len() - LINE_END.len()])
                    .trim()
                    .to_string();
                ctx.log.push(Severity::Debug, format!("device info: {info}"));
            }
            Err(Error::ReadTimeout) => debug!("no I# reply, continuing"),
            Err(err) => return Err(err),
        }

        Ok(())
    }

    fn program(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        image: &FirmwareImage,
        stats: &mut ProgramStats,
    ) -> Result<()> {
        let linear = image.linear_image();
        let total_chunks = linear.len().div_ceil(CHUNK_SIZE);
        ctx.progress.started(image.start_address(), total_chunks);

        for (index, chunk) in linear.chunks(CHUNK_SIZE).enumerate() {
            ctx.cancel.check()?;
            let destination = image.start_address() + (index * CHUNK_SIZE) as u32;

            if !self.applet_loaded {
                self.command(
                    ctx.link,
                    &format!("S{APPLET_ADDR:08X},{:08X}#", APPLET.len()),
                )?;
                ctx.link.write_all(&APPLET)?;
                self.applet_loaded = true;
            }

            // Applet parameters for this chunk, then execute it.
            self.write_word(ctx.link, PARAM_DST, destination)?;
            self.write_word(ctx.link, PARAM_SRC, BUFFER_ADDR)?;
            self.write_word(ctx.link, PARAM_LEN, chunk.len() as u32)?;
            self.command(ctx.link, &format!("X{APPLET_ADDR:08X}#"))?;

            // Stream the chunk into the staging buffer.
            self.command(
                ctx.link,
                &format!("S{BUFFER_ADDR:08X},{:08X}#", chunk.len()),
            )?;
            ctx.link.write_all(chunk)?;

            // Ask the bootloader to CRC the range it just wrote. A bare line
            // terminator is the pass answer; anything else is a mismatch.
            let expected = CRC32.checksum(chunk);
            self.command(ctx.link, &format!("Y{destination:08X},{expected:08X}#"))?;
            let reply = ctx.link.read_until(LINE_END, CHUNK_TIMEOUT)?;
            if reply != LINE_END {
                return Err(Error::VerifyFailed {
                    address: destination,
                });
            }

            stats.pages_written += 1;
            stats.bytes_written += chunk.len() as u32;
            ctx.progress.page_done(index + 1);
        }

        ctx.progress.completed();
        Ok(())
    }

    fn verify(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        _image: &FirmwareImage,
    ) -> Result<VerifyOutcome> {
        match self.verify_policy {
            // Every chunk was CRC-checked as it was written.
            VerifyPolicy::CrcAfterWrite => Ok(VerifyOutcome::Passed),
            VerifyPolicy::None => Ok(VerifyOutcome::Skipped),
            VerifyPolicy::ReadbackCompare => {
                ctx.log.push(
                    Severity::Warning,
                    "readback verify is not available over SAM-BA, CRC already checked".into(),
                );
                Ok(VerifyOutcome::Passed)
            }
        }
    }

    fn finish(&mut self, ctx: &mut StrategyCtx<'_>) -> Result<()> {
        if self.post_upload_reset {
            // The reset command differs per family and several bootloader
            // revisions lack one entirely; the application port reappearing
            // after close covers those.
            ctx.log.push(
                Severity::Info,
                "post-upload reset requested; relying on bootloader auto-start".into(),
            );
        }
        Ok(())
    }

    fn bootloader_version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}
