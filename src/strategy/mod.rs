//! Bootloader protocol drivers
//!
//! One driver per board family, behind a common phase contract the
//! orchestrator steps through: `begin` (handshake and enter programming
//! mode), `program`, `verify`, `finish`. Drivers hold no port themselves;
//! every phase receives the serial link through [StrategyCtx], which is what
//! lets the wire protocols run against a scripted endpoint in tests.

use serde::Serialize;
use strum::Display;

use crate::{
    boards::{Profile, StrategyTag},
    connection::SerialLink,
    error::Result,
    image::FirmwareImage,
    progress::ProgressCallbacks,
    uploader::{CancelToken, DiagnosticLog},
};

mod samba;
mod stk500;
mod uf2;

pub use samba::SamBa;
pub use stk500::Stk500;
pub use uf2::Uf2Download;

/// Everything a protocol phase needs from its surroundings.
pub struct StrategyCtx<'a> {
    pub link: &'a mut dyn SerialLink,
    pub progress: &'a mut dyn ProgressCallbacks,
    pub cancel: &'a CancelToken,
    pub log: &'a mut DiagnosticLog,
}

/// Counters accumulated while programming
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgramStats {
    pub bytes_written: u32,
    pub pages_written: u32,
}

/// What the verify phase concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
pub enum VerifyOutcome {
    /// Flash contents were checked and match.
    Passed,
    /// The profile's policy does not verify after write.
    Skipped,
}

/// The phase contract every serial bootloader driver implements
pub trait UploadStrategy {
    /// Handshake with the bootloader and enter programming mode.
    fn begin(&mut self, ctx: &mut StrategyCtx<'_>) -> Result<()>;

    /// Write the firmware image, page by page, strictly ascending. Counters
    /// accumulate in `stats` as pages land, so a cancelled or failed run
    /// still reports how much reached the flash.
    fn program(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        image: &FirmwareImage,
        stats: &mut ProgramStats,
    ) -> Result<()>;

    /// Check flash contents per the profile's verify policy.
    fn verify(&mut self, ctx: &mut StrategyCtx<'_>, image: &FirmwareImage)
        -> Result<VerifyOutcome>;

    /// Leave programming mode and, where supported, restart the sketch.
    fn finish(&mut self, ctx: &mut StrategyCtx<'_>) -> Result<()>;

    /// The version string the bootloader reported, when the protocol has one.
    fn bootloader_version(&self) -> Option<&str> {
        None
    }
}

/// Closed sum of the shipped drivers
pub enum Strategy {
    Stk500(Stk500),
    SamBa(SamBa),
    Uf2(Uf2Download),
}

impl Strategy {
    /// The profile is the dispatch key; nothing else selects a driver.
    pub fn select(profile: &Profile) -> Strategy {
        match profile.strategy {
            StrategyTag::Stk500V1 => Strategy::Stk500(Stk500::v1(profile)),
            StrategyTag::Stk500V2 => Strategy::Stk500(Stk500::v2(profile)),
            StrategyTag::SamBa => Strategy::SamBa(SamBa::new(profile)),
            StrategyTag::Uf2Download => Strategy::Uf2(Uf2Download::new(profile)),
        }
    }

    /// The serial driver, or `None` for the non-serial UF2 fallback.
    pub fn as_serial(&mut self) -> Option<&mut dyn UploadStrategy> {
        match self {
            Strategy::Stk500(driver) => Some(driver),
            Strategy::SamBa(driver) => Some(driver),
            Strategy::Uf2(_) => None,
        }
    }
}
