//! Serial port enumeration and USB device matching
//!
//! The registry is the only component that turns OS-level port listings into
//! [PortInfo] records, matches them against board VID/PID tables and watches
//! for arrival/removal during bootloader re-enumeration.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use log::debug;
use serde::Serialize;
use serialport::{available_ports, SerialPortType};

use crate::error::{Error, Result};

/// How often the watcher re-polls the OS port list.
pub const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A USB serial endpoint as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// OS device path (`/dev/ttyACM0`, `COM7`, ...).
    pub name: String,
    pub vid: u16,
    pub pid: u16,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl PortInfo {
    pub fn matches(&self, pairs: &[(u16, u16)]) -> bool {
        pairs
            .iter()
            .any(|(vid, pid)| self.vid == *vid && self.pid == *pid)
    }

    fn key(&self) -> (u16, u16, String) {
        (self.vid, self.pid, self.name.clone())
    }
}

/// Port arrival/removal events, in OS order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    Added(PortInfo),
    Removed(PortInfo),
}

/// List the USB serial ports currently present.
pub fn list() -> Result<Vec<PortInfo>> {
    let ports = available_ports().map_err(Error::from)?;

    Ok(ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => Some(PortInfo {
                name: port.port_name,
                vid: usb.vid,
                pid: usb.pid,
                product: usb.product,
                serial_number: usb.serial_number,
            }),
            _ => None,
        })
        .collect())
}

/// Find a present port by its OS device path.
pub fn find_by_name(name: &str) -> Result<PortInfo> {
    list()?
        .into_iter()
        .find(|port| port.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::PortNotFound(name.to_string()))
}

/// All present ports whose VID/PID matches one of `pairs`.
pub fn find_matches(pairs: &[(u16, u16)]) -> Result<Vec<PortInfo>> {
    Ok(list()?
        .into_iter()
        .filter(|port| port.matches(pairs))
        .collect())
}

/// Poll until at least one port matching `pairs` appears, or `timeout`
/// elapses. Returns every candidate present at that moment, leaving the
/// single-vs-ambiguous decision to the caller.
pub fn wait_for_match(pairs: &[(u16, u16)], timeout: Duration) -> Result<Vec<PortInfo>> {
    let deadline = Instant::now() + timeout;

    loop {
        let matches = find_matches(pairs)?;
        if !matches.is_empty() {
            return Ok(matches);
        }
        if Instant::now() >= deadline {
            return Ok(Vec::new());
        }
        std::thread::sleep(WATCH_POLL_INTERVAL);
    }
}

/// Poll-driven port watcher
///
/// Produces [PortEvent]s by diffing successive OS listings. Rapid
/// unplug/replug cycles inside one poll interval collapse into a single
/// event per (vid, pid, path).
pub struct PortWatcher {
    known: HashMap<(u16, u16, String), PortInfo>,
}

impl PortWatcher {
    /// Start watching from the current port list.
    pub fn new() -> Result<Self> {
        let known = list()?
            .into_iter()
            .map(|port| (port.key(), port))
            .collect();
        Ok(PortWatcher { known })
    }

    /// One poll step: returns the events since the previous call.
    pub fn poll(&mut self) -> Result<Vec<PortEvent>> {
        let current: HashMap<_, _> = list()?
            .into_iter()
            .map(|port| (port.key(), port))
            .collect();

        let mut events = Vec::new();
        for (key, port) in &self.known {
            if !current.contains_key(key) {
                debug!("port removed: {}", port.name);
                events.push(PortEvent::Removed(port.clone()));
            }
        }
        for (key, port) in &current {
            if !self.known.contains_key(key) {
                debug!("port added: {}", port.name);
                events.push(PortEvent::Added(port.clone()));
            }
        }

        self.known = current;
        Ok(events)
    }

    /// Block until a port matching `pairs` is added, or `timeout` elapses.
    pub fn wait_added(
        &mut self,
        pairs: &[(u16, u16)],
        timeout: Duration,
    ) -> Result<Option<PortInfo>> {
        let deadline = Instant::now() + timeout;

        loop {
            for event in self.poll()? {
                if let PortEvent::Added(port) = event {
                    if port.matches(pairs) {
                        return Ok(Some(port));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(WATCH_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn port(vid: u16, pid: u16, name: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid,
            pid,
            product: None,
            serial_number: None,
        }
    }

    #[test]
    fn vidpid_matching() {
        let info = port(0x2341, 0x0069, "/dev/ttyACM0");

        assert!(info.matches(&[(0x2341, 0x0069), (0x2341, 0x006D)]));
        assert!(!info.matches(&[(0x2341, 0x0043)]));
        assert!(!info.matches(&[]));
    }

    #[test]
    fn keys_distinguish_same_device_on_new_path() {
        let before = port(0x2341, 0x0069, "/dev/ttyACM0");
        let after = port(0x2341, 0x0069, "/dev/ttyACM1");

        assert_ne!(before.key(), after.key());
    }
}
