//! STK500 drivers for classic AVR bootloaders
//!
//! v1 is the two-byte-response dialect spoken by the Uno and Nano optiboot
//! bootloaders; v2 is the framed dialect of the Mega 2560. Both program the
//! flash a page at a time through the resident bootloader, so no fuse or
//! lock handling exists here.

use std::{thread::sleep, time::Duration};

use log::debug;

use super::{ProgramStats, StrategyCtx, UploadStrategy, VerifyOutcome};
use crate::{
    boards::{Profile, VerifyPolicy},
    connection::SerialLink,
    error::{Error, Result},
    image::FirmwareImage,
    uploader::Severity,
};

const MAX_SYNC_ATTEMPTS: u32 = 10;
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Per-transaction deadline for everything except a full page program.
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(1);
const PAGE_TIMEOUT: Duration = Duration::from_secs(3);

// v1 command bytes. Every request ends with CRC_EOP; every response is
// INSYNC <payload> OK.
mod v1 {
    pub const GET_SYNC: u8 = 0x30;
    pub const ENTER_PROGMODE: u8 = 0x50;
    pub const LEAVE_PROGMODE: u8 = 0x51;
    pub const LOAD_ADDRESS: u8 = 0x55;
    pub const PROG_PAGE: u8 = 0x64;
    pub const READ_PAGE: u8 = 0x74;
    pub const READ_SIGN: u8 = 0x75;
    pub const CRC_EOP: u8 = 0x20;
    pub const INSYNC: u8 = 0x14;
    pub const OK: u8 = 0x10;
}

// v2 message framing and the ISP command subset Arduino bootloaders answer.
mod v2 {
    pub const MESSAGE_START: u8 = 0x1B;
    pub const TOKEN: u8 = 0x0E;
    pub const STATUS_CMD_OK: u8 = 0x00;

    pub const CMD_SIGN_ON: u8 = 0x01;
    pub const CMD_LOAD_ADDRESS: u8 = 0x06;
    pub const CMD_ENTER_PROGMODE_ISP: u8 = 0x10;
    pub const CMD_LEAVE_PROGMODE_ISP: u8 = 0x11;
    pub const CMD_PROGRAM_FLASH_ISP: u8 = 0x13;
    pub const CMD_READ_FLASH_ISP: u8 = 0x14;
    pub const CMD_READ_SIGNATURE_ISP: u8 = 0x1B;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    V1,
    V2,
}

/// STK500 protocol driver
pub struct Stk500 {
    wire: Wire,
    page_size: u32,
    flash_size: u32,
    verify_policy: VerifyPolicy,
    expected_signature: Option<[u8; 3]>,
    sequence: u8,
    version: Option<String>,
}

impl Stk500 {
    pub fn v1(profile: &Profile) -> Self {
        Self::new(Wire::V1, profile)
    }

    pub fn v2(profile: &Profile) -> Self {
        Self::new(Wire::V2, profile)
    }

    fn new(wire: Wire, profile: &Profile) -> Self {
        Stk500 {
            wire,
            page_size: profile.page_size,
            flash_size: profile.flash_size,
            verify_policy: profile.verify,
            expected_signature: profile.signature,
            sequence: 0,
            version: None,
        }
    }

    /// One v1 request/response exchange. `payload` is the expected byte count
    /// between INSYNC and OK.
    fn transact_v1(
        &mut self,
        link: &mut dyn SerialLink,
        request: &[u8],
        payload: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        link.write_all(request)?;
        let response = link.read_exact(payload + 2, timeout)?;

        if response.first() != Some(&v1::INSYNC) || response.last() != Some(&v1::OK) {
            debug!("stk500v1 out of sync: {response:02x?}");
            return Err(Error::SyncFailed);
        }
        Ok(response[1..1 + payload].to_vec())
    }

    /// One v2 framed exchange. Returns the message body after the status
    /// byte has been checked.
    fn transact_v2(
        &mut self,
        link: &mut dyn SerialLink,
        body: &[u8],
        payload: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let len = body.len() as u16;
        let mut frame = Vec::with_capacity(body.len() + 6);
        frame.push(v2::MESSAGE_START);
        frame.push(sequence);
        frame.push((len >> 8) as u8);
        frame.push(len as u8);
        frame.push(v2::TOKEN);
        frame.extend_from_slice(body);
        let checksum = frame.iter().fold(0u8, |acc, byte| acc ^ byte);
        frame.push(checksum);

        link.write_all(&frame)?;

        let header = link.read_exact(5, timeout)?;
        if header[0] != v2::MESSAGE_START || header[1] != sequence || header[4] != v2::TOKEN {
            debug!("stk500v2 bad frame header: {header:02x?}");
            return Err(Error::SyncFailed);
        }
        let response_len = usize::from(u16::from_be_bytes([header[2], header[3]]));
        if response_len < 2 + payload {
            return Err(Error::SyncFailed);
        }

        let rest = link.read_exact(response_len + 1, timeout)?;
        let mut checksum = header.iter().fold(0u8, |acc, byte| acc ^ byte);
        checksum = rest.iter().fold(checksum, |acc, byte| acc ^ byte);
        if checksum != 0 {
            debug!("stk500v2 frame checksum mismatch");
            return Err(Error::SyncFailed);
        }

        let response_body = &rest[..response_len];
        if response_body[0] != body[0] || response_body[1] != v2::STATUS_CMD_OK {
            debug!("stk500v2 command failed: {response_body:02x?}");
            return Err(Error::SyncFailed);
        }
        Ok(response_body[2..].to_vec())
    }

    fn sync(&mut self, ctx: &mut StrategyCtx<'_>) -> Result<()> {
        for attempt in 0..MAX_SYNC_ATTEMPTS {
            if attempt > 0 {
                sleep(SYNC_RETRY_DELAY);
            }
            ctx.link.clear_input()?;

            let result = match self.wire {
                Wire::V1 => self
                    .transact_v1(
                        ctx.link,
                        &[v1::GET_SYNC, v1::CRC_EOP],
                        0,
                        TRANSACTION_TIMEOUT,
                    )
                    .map(|_| ()),
                Wire::V2 => self
                    .transact_v2(ctx.link, &[v2::CMD_SIGN_ON], 0, TRANSACTION_TIMEOUT)
                    .map(|body| {
                        // Body is the programmer id length followed by the
                        // id string itself.
                        if body.len() > 1 {
                            if let Ok(name) = std::str::from_utf8(&body[1..]) {
                                self.version = Some(name.trim_matches(char::from(0)).into());
                            }
                        }
                    }),
            };

            match result {
                Ok(()) => {
                    debug!("bootloader in sync after {} attempts", attempt + 1);
                    return Ok(());
                }
                Err(Error::ReadTimeout) | Err(Error::SyncFailed) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(Error::SyncFailed)
    }

    fn read_signature(&mut self, ctx: &mut StrategyCtx<'_>) -> Result<[u8; 3]> {
        match self.wire {
            Wire::V1 => {
                let bytes = self.transact_v1(
                    ctx.link,
                    &[v1::READ_SIGN, v1::CRC_EOP],
                    3,
                    TRANSACTION_TIMEOUT,
                )?;
                Ok([bytes[0], bytes[1], bytes[2]])
            }
            Wire::V2 => {
                let mut signature = [0u8; 3];
                for (index, byte) in signature.iter_mut().enumerate() {
                    // SPI "read signature" instruction relayed through the
                    // bootloader, one byte per exchange.
                    let body = [
                        v2::CMD_READ_SIGNATURE_ISP,
                        4,
                        0x30,
                        0x00,
                        index as u8,
                        0x00,
                    ];
                    let response =
                        self.transact_v2(ctx.link, &body, 1, TRANSACTION_TIMEOUT)?;
                    *byte = response[0];
                }
                Ok(signature)
            }
        }
    }

    fn load_address(&mut self, link: &mut dyn SerialLink, byte_address: u32) -> Result<()> {
        // Flash is word addressed on AVR.
        let word_address = byte_address / 2;

        match self.wire {
            Wire::V1 => {
                let request = [
                    v1::LOAD_ADDRESS,
                    word_address as u8,
                    (word_address >> 8) as u8,
                    v1::CRC_EOP,
                ];
                self.transact_v1(link, &request, 0, TRANSACTION_TIMEOUT)?;
            }
            Wire::V2 => {
                let mut address = word_address;
                if self.flash_size > 128 * 1024 {
                    // Parts above 128 KiB need the extended addressing flag.
                    address |= 1 << 31;
                }
                let request = [
                    v2::CMD_LOAD_ADDRESS,
                    (address >> 24) as u8,
                    (address >> 16) as u8,
                    (address >> 8) as u8,
                    address as u8,
                ];
                self.transact_v2(link, &request, 0, TRANSACTION_TIMEOUT)?;
            }
        }
        Ok(())
    }

    fn program_page(&mut self, link: &mut dyn SerialLink, data: &[u8]) -> Result<()> {
        let size = data.len() as u16;

        match self.wire {
            Wire::V1 => {
                let mut request = Vec::with_capacity(data.len() + 5);
                request.push(v1::PROG_PAGE);
                request.push((size >> 8) as u8);
                request.push(size as u8);
                request.push(b'F');
                request.extend_from_slice(data);
                request.push(v1::CRC_EOP);
                self.transact_v1(link, &request, 0, PAGE_TIMEOUT)?;
            }
            Wire::V2 => {
                let mut body = Vec::with_capacity(data.len() + 10);
                body.extend_from_slice(&[
                    v2::CMD_PROGRAM_FLASH_ISP,
                    (size >> 8) as u8,
                    size as u8,
                    0xC1, // page mode, write page, poll RDY/BSY
                    0x0A,
                    0x40, // load page low byte
                    0x4C, // write page
                    0x20, // read low byte (poll)
                    0x00,
                    0x00,
                ]);
                body.extend_from_slice(data);
                self.transact_v2(link, &body, 0, PAGE_TIMEOUT)?;
            }
        }
        Ok(())
    }

    fn read_page(&mut self, link: &mut dyn SerialLink, size: usize) -> Result<Vec<u8>> {
        match self.wire {
            Wire::V1 => {
                let request = [
                    v1::READ_PAGE,
                    (size >> 8) as u8,
                    size as u8,
                    b'F',
                    v1::CRC_EOP,
                ];
                self.transact_v1(link, &request, size, PAGE_TIMEOUT)
            }
            Wire::V2 => {
                let body = [
                    v2::CMD_READ_FLASH_ISP,
                    (size >> 8) as u8,
                    size as u8,
                    0x20,
                ];
                let mut response = self.transact_v2(link, &body, size, PAGE_TIMEOUT)?;
                // A trailing status byte follows the data.
                response.truncate(size);
                Ok(response)
            }
        }
    }
}

impl UploadStrategy for Stk500 {
    fn begin(&mut self, ctx: &mut StrategyCtx<'_>) -> Result<()> {
        self.sync(ctx)?;

        match self.wire {
            Wire::V1 => {
                self.transact_v1(
                    ctx.link,
                    &[v1::ENTER_PROGMODE, v1::CRC_EOP],
                    0,
                    TRANSACTION_TIMEOUT,
                )?;
            }
            Wire::V2 => {
                // avrdude's ISP parameter block: timeout, stab delay, cmd
                // exec delay, sync loops, byte delay, poll value, poll index,
                // then the SPI "program enable" instruction.
                let body = [
                    v2::CMD_ENTER_PROGMODE_ISP,
                    200,
                    100,
                    25,
                    32,
                    0,
                    0x53,
                    3,
                    0xAC,
                    0x53,
                    0x00,
                    0x00,
                ];
                self.transact_v2(ctx.link, &body, 0, TRANSACTION_TIMEOUT)?;
            }
        }

        if let Some(expected) = self.expected_signature {
            let found = self.read_signature(ctx)?;
            if found != expected {
                return Err(Error::SignatureMismatch { expected, found });
            }
            ctx.log.push(
                Severity::Info,
                format!("device signature {found:02x?} verified"),
            );
        }

        Ok(())
    }

    fn program(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        image: &FirmwareImage,
        stats: &mut ProgramStats,
    ) -> Result<()> {
        let total_pages = image.linear_image().len() / self.page_size as usize;
        ctx.progress.started(image.start_address(), total_pages);

        for (index, page) in image.page_iter(self.page_size).enumerate() {
            ctx.cancel.check()?;
            if page.is_blank() {
                // Erased flash already reads 0xFF.
                ctx.progress.page_done(index + 1);
                continue;
            }

            self.load_address(ctx.link, page.addr)?;
            self.program_page(ctx.link, &page.data)?;

            stats.pages_written += 1;
            stats.bytes_written += page.data.len() as u32;
            ctx.progress.page_done(index + 1);
        }

        ctx.progress.completed();
        Ok(())
    }

    fn verify(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        image: &FirmwareImage,
    ) -> Result<VerifyOutcome> {
        match self.verify_policy {
            VerifyPolicy::None => return Ok(VerifyOutcome::Skipped),
            VerifyPolicy::CrcAfterWrite => {
                // The bootloaders this driver speaks to have no CRC command.
                ctx.log.push(
                    Severity::Warning,
                    "profile requests CRC verify, falling back to readback".into(),
                );
            }
            VerifyPolicy::ReadbackCompare => {}
        }

        for page in image.page_iter(self.page_size) {
            ctx.cancel.check()?;
            if page.is_blank() {
                continue;
            }

            self.load_address(ctx.link, page.addr)?;
            let readback = self.read_page(ctx.link, page.data.len())?;
            if readback != *page.data {
                return Err(Error::VerifyFailed { address: page.addr });
            }
        }

        Ok(VerifyOutcome::Passed)
    }

    fn finish(&mut self, ctx: &mut StrategyCtx<'_>) -> Result<()> {
        match self.wire {
            Wire::V1 => {
                self.transact_v1(
                    ctx.link,
                    &[v1::LEAVE_PROGMODE, v1::CRC_EOP],
                    0,
                    TRANSACTION_TIMEOUT,
                )?;
            }
            Wire::V2 => {
                let body = [v2::CMD_LEAVE_PROGMODE_ISP, 1, 1];
                self.transact_v2(ctx.link, &body, 0, TRANSACTION_TIMEOUT)?;
            }
        }
        Ok(())
    }

    fn bootloader_version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}
