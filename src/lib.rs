//! Firmware upload engine for Arduino-family boards
//!
//! Drives the serial bootloader protocols the Arduino ecosystem ships —
//! STK500 (v1 and v2), SAM-BA, and the UF2 mass-storage fallback — over a
//! native serial port, including the reset choreography (DTR pulse,
//! 1200-baud touch), bootloader port re-enumeration, and handing the port
//! back to a serial monitor when the upload ends.

pub mod boards;
pub mod connection;
pub mod error;
pub mod image;
pub mod monitor;
pub mod ports;
pub mod progress;
pub mod strategy;
pub mod uploader;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{Error, ErrorKind};

#[cfg(feature = "cli")]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
