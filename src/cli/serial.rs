//! Serial port selection for the CLI

use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use log::{error, info};
use serialport::UsbPortInfo;

use crate::{
    cli::{config::Config, ConnectArgs},
    error::Error,
    ports::{self, PortInfo},
};

/// Return the port to use, taking into account the different ways of
/// choosing one.
///
/// A port named on the command line wins. Otherwise the user picks from the
/// detected USB serial ports, with ports matching the selected board profile
/// or a remembered device preselected when unambiguous.
pub fn select_port(
    args: &ConnectArgs,
    config: &Config,
    preferred: &[(u16, u16)],
) -> Result<PortInfo, Error> {
    if let Some(name) = &args.port {
        return ports::find_by_name(name);
    }

    let available = ports::list()?;
    if available.is_empty() {
        return Err(Error::PortNotFound("no USB serial ports".into()));
    }

    let known: Vec<&PortInfo> = available
        .iter()
        .filter(|port| is_known(port, config, preferred))
        .collect();

    if let [port] = known.as_slice() {
        if !args.confirm_port {
            return Ok((*port).clone());
        }
    }

    if let [port] = available.as_slice() {
        // A single unrecognized port: confirm before using it.
        return if confirm_port(port)? {
            Ok(port.clone())
        } else {
            Err(Error::PortNotFound(port.name.clone()))
        };
    }

    info!("Detected {} serial ports", available.len());
    info!("Ports matching the selected board are listed first");

    let mut sorted = available.clone();
    sorted.sort_by_key(|port| !is_known(port, config, preferred));

    let labels: Vec<String> = sorted
        .iter()
        .map(|port| match &port.product {
            Some(product) => format!("{} - {}", port.name, product),
            None => port.name.clone(),
        })
        .collect();

    let index = Select::with_theme(&ColorfulTheme::default())
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(|err| {
            error!("port selection failed: {err}");
            Error::Cancelled
        })?
        .ok_or(Error::Cancelled)?;

    let selected = sorted[index].clone();
    offer_to_remember(&selected, config);
    Ok(selected)
}

fn is_known(port: &PortInfo, config: &Config, preferred: &[(u16, u16)]) -> bool {
    if port.matches(preferred) {
        return true;
    }
    let usb = UsbPortInfo {
        vid: port.vid,
        pid: port.pid,
        serial_number: None,
        manufacturer: None,
        product: None,
    };
    config.usb_device.iter().any(|device| device.matches(&usb))
}

fn confirm_port(port: &PortInfo) -> Result<bool, Error> {
    let prompt = match &port.product {
        Some(product) => format!("Use serial port '{}' - {}?", port.name, product),
        None => format!("Use serial port '{}'?", port.name),
    };

    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .interact_opt()
        .map_err(|_| Error::Cancelled)?
        .ok_or(Error::Cancelled)
}

fn offer_to_remember(port: &PortInfo, config: &Config) {
    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this serial port for future use?")
        .interact_opt()
        .unwrap_or_default()
        .unwrap_or_default();

    if remember {
        // Allow this to fail without aborting the upload, but tell the user.
        if let Err(err) = config.save_with(|config| {
            config.usb_device.push(super::config::UsbDevice {
                vid: port.vid,
                pid: port.pid,
            });
        }) {
            error!("Failed to save config {err:#}");
        }
    }
}
