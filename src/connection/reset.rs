//! Reset sequences that move a board into its bootloader
//!
//! Classic AVR boards wire DTR to the MCU reset line through the USB-serial
//! bridge; pulsing it restarts the chip into the serial bootloader.
//! Native-USB boards instead watch for the 1200-baud touch, which is an
//! out-of-band operation on a closed port and lives on
//! [`SerialTransport::touch_1200`](super::SerialTransport::touch_1200).

use std::{thread::sleep, time::Duration};

use log::debug;

use super::SerialLink;
use crate::error::Result;

/// Width of the reset pulse on the DTR line.
const DEFAULT_PULSE: Duration = Duration::from_millis(50);
/// Time the bootloader needs to start accepting bytes after reset.
const BOOT_DELAY: Duration = Duration::from_millis(250);

/// In-band reset performed on an already open port
pub trait ResetStrategy {
    fn reset(&self, link: &mut dyn SerialLink) -> Result<()>;
}

/// Pulse DTR (and RTS) low, then release, restarting a classic AVR into its
/// bootloader.
#[derive(Debug, Clone, Copy)]
pub struct DtrPulseReset {
    pulse: Duration,
}

impl DtrPulseReset {
    pub fn new() -> Self {
        DtrPulseReset {
            pulse: DEFAULT_PULSE,
        }
    }
}

impl Default for DtrPulseReset {
    fn default() -> Self {
        Self::new()
    }
}

impl ResetStrategy for DtrPulseReset {
    fn reset(&self, link: &mut dyn SerialLink) -> Result<()> {
        debug!("DTR pulse reset ({} ms)", self.pulse.as_millis());

        link.set_lines(false, false)?;
        sleep(self.pulse);
        link.set_lines(true, true)?;

        // Give the bootloader time to start, then drop whatever the sketch
        // printed before the reset took effect.
        sleep(BOOT_DELAY);
        link.clear_input()?;

        Ok(())
    }
}

/// Used for boards that are already sitting in their bootloader.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReset;

impl ResetStrategy for NoReset {
    fn reset(&self, link: &mut dyn SerialLink) -> Result<()> {
        debug!("no reset requested");
        link.clear_input()
    }
}
