//! UF2 download fallback for mass-storage bootloaders
//!
//! Boards like the RP2040 are not programmed over serial at all: the
//! firmware is handed back to the host as a `.uf2` artifact together with
//! copy instructions, and the serial monitor is left untouched.

use log::info;

use crate::{
    boards::{Family, Profile},
    error::{Error, Result},
    image::{FirmwareImage, ImageFormat},
    uploader::{DiagnosticLog, HostCapabilities, Severity},
};

/// Non-serial download driver
pub struct Uf2Download {
    family: Family,
}

impl Uf2Download {
    pub fn new(profile: &Profile) -> Self {
        Uf2Download {
            family: profile.family,
        }
    }

    /// Validate the artifact and hand it to the host for export. Fails with
    /// [`Error::UnsupportedStrategy`] when the host cannot take it.
    pub fn prepare(
        &self,
        image: &FirmwareImage,
        caps: &mut dyn HostCapabilities,
        log: &mut DiagnosticLog,
    ) -> Result<()> {
        let extension = match image.format() {
            ImageFormat::Uf2 => "uf2",
            // Teensy's external loader takes the hex artifact as-is.
            ImageFormat::IntelHex => "hex",
            ImageFormat::RawBinary => "bin",
        };
        let name = format!("{}-firmware.{extension}", self.family);

        let exported = caps.export_artifact(&name, image.linear_image())?;
        if !exported {
            return Err(Error::UnsupportedStrategy(self.family.to_string()));
        }

        info!("exported {name}");
        log.push(
            Severity::Info,
            format!(
                "{name} exported; copy it onto the board's bootloader drive \
                 (double-tap reset to mount it)"
            ),
        );
        Ok(())
    }
}
