//! Monitor/upload port handoff
//!
//! [MonitorCoupler] owns the serial port whenever no upload is running. A
//! paused monitor is not a flag on a shared port: pausing and releasing
//! moves the handle out, and the uploader gives it back through
//! [`resume`](MonitorCoupler::resume). The coupler holds the port as a
//! [SerialLink] trait object, so its state machine runs against a scripted
//! endpoint in tests the same way the strategies do. It is UI-free; a
//! terminal front end pumps bytes out of it.

use std::time::Duration;

use log::debug;
use strum::Display;

use crate::{
    connection::{SerialLink, SerialTransport},
    error::{Error, Result},
    ports::PortInfo,
};

/// Coupler lifecycle: Running ↔ Paused ↔ Released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CouplerState {
    /// Port open, reads dispatched to the front end.
    Running,
    /// Port still open but reads stopped; an upload is about to take over.
    Paused,
    /// Port closed and handed off.
    Released,
}

/// Owns the monitor side of the serial port
pub struct MonitorCoupler {
    state: CouplerState,
    link: Option<Box<dyn SerialLink>>,
    baud: Option<u32>,
}

impl Default for MonitorCoupler {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorCoupler {
    /// A coupler with no monitor attached yet.
    pub fn new() -> Self {
        MonitorCoupler {
            state: CouplerState::Released,
            link: None,
            baud: None,
        }
    }

    /// Adopt an already open monitor port.
    pub fn attach(&mut self, link: Box<dyn SerialLink>) {
        self.baud = Some(link.baud());
        self.link = Some(link);
        self.state = CouplerState::Running;
    }

    pub fn state(&self) -> CouplerState {
        self.state
    }

    /// The baud the monitor was last running at.
    pub fn current_baud(&self) -> Option<u32> {
        self.baud
    }

    /// Stop dispatching reads. Keeps the port open. Idempotent; a coupler
    /// with no monitor stays released.
    pub fn pause(&mut self) {
        if self.state == CouplerState::Running {
            debug!("monitor paused");
            self.state = CouplerState::Paused;
        }
    }

    /// Close the port so an upload can claim it. Idempotent.
    pub fn release(&mut self) {
        drop(self.link.take());
        if self.state != CouplerState::Released {
            debug!("monitor released");
            self.state = CouplerState::Released;
        }
    }

    /// Reopen at `baud` and re-arm reads. A synthetic CRLF is emitted on a
    /// fresh open so sketches waiting for the host see activity. Calling
    /// this again with the same target is a no-op.
    pub fn resume(&mut self, baud: u32, port: &PortInfo) -> Result<()> {
        match self.state {
            CouplerState::Running => {
                if self.baud == Some(baud) {
                    return Ok(());
                }
                if let Some(link) = self.link.as_mut() {
                    link.reopen_at(baud)?;
                }
            }
            CouplerState::Paused => {
                if self.baud != Some(baud) {
                    if let Some(link) = self.link.as_mut() {
                        link.reopen_at(baud)?;
                    }
                }
            }
            CouplerState::Released => {
                let mut transport = SerialTransport::open(port, baud)?;
                transport.write_all(b"\r\n")?;
                self.link = Some(Box::new(transport));
            }
        }

        debug!("monitor running at {baud} baud");
        self.baud = Some(baud);
        self.state = CouplerState::Running;
        Ok(())
    }

    /// Hand the open port to a front end, leaving the coupler released.
    pub fn take_link(&mut self) -> Option<Box<dyn SerialLink>> {
        self.state = CouplerState::Released;
        self.link.take()
    }

    /// Read whatever the sketch printed, when running. A quiet line yields
    /// `None`; paused and released couplers never read.
    pub fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if self.state != CouplerState::Running {
            return Ok(None);
        }
        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return Ok(None),
        };

        let mut buf = [0u8; 1024];
        match link.read_some(&mut buf, timeout) {
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(Error::ReadTimeout) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Forward user keystrokes to the sketch.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self.link.as_mut() {
            Some(link) if self.state == CouplerState::Running => link.write_all(bytes),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn port(name: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: 0x2341,
            pid: 0x0043,
            product: None,
            serial_number: None,
        }
    }

    /// Counts the line-level operations the coupler performs on its port.
    #[derive(Default)]
    struct Counters {
        reopens: AtomicUsize,
        writes: AtomicUsize,
    }

    struct CountingLink {
        baud: u32,
        counters: Arc<Counters>,
    }

    impl CountingLink {
        fn new(baud: u32, counters: Arc<Counters>) -> Self {
            CountingLink { baud, counters }
        }
    }

    impl SerialLink for CountingLink {
        fn write_all(&mut self, _bytes: &[u8]) -> Result<()> {
            self.counters.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn read_some(&mut self, _buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            Err(Error::ReadTimeout)
        }

        fn set_lines(&mut self, _dtr: bool, _rts: bool) -> Result<()> {
            Ok(())
        }

        fn reopen_at(&mut self, baud: u32) -> Result<()> {
            self.counters.reopens.fetch_add(1, Ordering::SeqCst);
            self.baud = baud;
            Ok(())
        }

        fn clear_input(&mut self) -> Result<()> {
            Ok(())
        }

        fn baud(&self) -> u32 {
            self.baud
        }
    }

    #[test]
    fn fresh_coupler_is_released() {
        let coupler = MonitorCoupler::new();
        assert_eq!(coupler.state(), CouplerState::Released);
        assert_eq!(coupler.current_baud(), None);
    }

    #[test]
    fn pause_and_release_are_idempotent_when_detached() {
        let mut coupler = MonitorCoupler::new();

        coupler.pause();
        coupler.pause();
        assert_eq!(coupler.state(), CouplerState::Released);

        coupler.release();
        coupler.release();
        assert_eq!(coupler.state(), CouplerState::Released);
    }

    #[test]
    fn pause_twice_equals_pause_once() {
        let counters = Arc::new(Counters::default());
        let mut coupler = MonitorCoupler::new();
        coupler.attach(Box::new(CountingLink::new(115_200, counters.clone())));

        coupler.pause();
        coupler.pause();

        assert_eq!(coupler.state(), CouplerState::Paused);
        assert_eq!(counters.reopens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resume_twice_with_same_target_is_a_no_op() {
        let counters = Arc::new(Counters::default());
        let mut coupler = MonitorCoupler::new();
        coupler.attach(Box::new(CountingLink::new(115_200, counters.clone())));
        coupler.pause();

        let target = port("/dev/ttyACM0");
        coupler.resume(115_200, &target).unwrap();
        assert_eq!(coupler.state(), CouplerState::Running);

        // The second call with identical arguments must not touch the port.
        coupler.resume(115_200, &target).unwrap();

        assert_eq!(coupler.state(), CouplerState::Running);
        assert_eq!(coupler.current_baud(), Some(115_200));
        assert_eq!(counters.reopens.load(Ordering::SeqCst), 0);
        assert_eq!(counters.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resume_at_a_new_baud_reopens_exactly_once() {
        let counters = Arc::new(Counters::default());
        let mut coupler = MonitorCoupler::new();
        coupler.attach(Box::new(CountingLink::new(115_200, counters.clone())));
        coupler.pause();

        let target = port("/dev/ttyACM0");
        coupler.resume(9_600, &target).unwrap();
        coupler.resume(9_600, &target).unwrap();

        assert_eq!(coupler.state(), CouplerState::Running);
        assert_eq!(coupler.current_baud(), Some(9_600));
        assert_eq!(counters.reopens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn released_coupler_never_reads() {
        let mut coupler = MonitorCoupler::new();
        let chunk = coupler
            .read_chunk(Duration::from_millis(1))
            .unwrap();
        assert!(chunk.is_none());
    }

    #[test]
    fn writes_are_dropped_unless_running() {
        let mut coupler = MonitorCoupler::new();
        coupler.write(b"hello").unwrap();
    }
}
