//! Persistent CLI configuration
//!
//! A small TOML file remembering USB devices the user told us about and
//! their preferred monitor baud. The upload engine itself stays stateless;
//! only the front end remembers anything.

use std::{
    fs::{create_dir_all, read_to_string, write},
    path::PathBuf,
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};
use serialport::UsbPortInfo;

/// A USB device the user chose to remember
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsbDevice {
    pub vid: u16,
    pub pid: u16,
}

impl UsbDevice {
    pub fn matches(&self, port: &UsbPortInfo) -> bool {
        self.vid == port.vid && self.pid == port.pid
    }
}

/// Deserialized contents of the configuration file
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Devices to prefer during port selection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
    /// Baud the monitor last ran at successfully.
    #[serde(default)]
    pub monitor_baud: Option<u32>,
    #[serde(skip)]
    save_path: Option<PathBuf>,
}

impl Config {
    /// Load the config file, if any.
    pub fn load() -> Result<Self> {
        let Some(dirs) = ProjectDirs::from("rs", "arduflash", "arduflash") else {
            return Ok(Self::default());
        };
        let path = dirs.config_dir().join("arduflash.toml");

        let mut config = if path.exists() {
            let content = read_to_string(&path)
                .into_diagnostic()
                .wrap_err("Failed to read the configuration file")?;
            toml::from_str::<Config>(&content)
                .into_diagnostic()
                .wrap_err("Failed to parse the configuration file")?
        } else {
            Self::default()
        };

        debug!("config loaded from {}", path.display());
        config.save_path = Some(path);
        Ok(config)
    }

    /// Apply `modify` and write the file back.
    pub fn save_with<F>(&self, modify: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        let mut updated = Config {
            usb_device: self.usb_device.clone(),
            monitor_baud: self.monitor_baud,
            save_path: self.save_path.clone(),
        };
        modify(&mut updated);

        let Some(path) = &updated.save_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            create_dir_all(parent).into_diagnostic()?;
        }

        let serialized = toml::to_string(&updated)
            .into_diagnostic()
            .wrap_err("Failed to serialize configuration")?;
        write(path, serialized)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write {}", path.display()))
    }
}
