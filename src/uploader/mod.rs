//! Upload orchestration
//!
//! [Uploader] drives one upload end to end: resolve the board profile, take
//! the port from the monitor, reset the board into its bootloader, run the
//! protocol driver, and hand the port back at the previously negotiated
//! monitor baud rate — on every exit path. It never panics and never throws
//! past its boundary; the result is always a filled [UploadReport].

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use serde::Serialize;
use strum::Display;

use crate::{
    boards::{Profile, ResetMethod},
    connection::{
        reset::{DtrPulseReset, NoReset, ResetStrategy},
        SerialTransport,
    },
    error::{Error, ErrorKind, Result},
    image::{FirmwareImage, FormatHint},
    monitor::MonitorCoupler,
    ports::{self, PortInfo},
    progress::ProgressCallbacks,
    strategy::{ProgramStats, Strategy, StrategyCtx, VerifyOutcome},
};

/// How long a native-USB board gets to re-enumerate as its bootloader.
const BOOTLOADER_WAIT: Duration = Duration::from_secs(10);
/// How long the application port gets to come back after programming.
const APP_PORT_WAIT: Duration = Duration::from_secs(2);

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);
static ACTIVE_SESSIONS: Mutex<Option<HashSet<String>>> = Mutex::new(None);

/// Severity of a diagnostic entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// One line of the structured upload log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticEntry {
    pub severity: Severity,
    pub message: String,
}

/// Ordered, structured log surfaced in the [UploadReport]
#[derive(Debug, Default)]
pub struct DiagnosticLog {
    entries: Vec<DiagnosticEntry>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry and mirror it onto the process logger.
    pub fn push(&mut self, severity: Severity, message: String) {
        match severity {
            Severity::Debug => debug!("{message}"),
            Severity::Info => info!("{message}"),
            Severity::Warning => warn!("{message}"),
            Severity::Error => log::error!("{message}"),
        }
        self.entries.push(DiagnosticEntry { severity, message });
    }

    pub fn entries(&self) -> &[DiagnosticEntry] {
        &self.entries
    }

    fn into_entries(self) -> Vec<DiagnosticEntry> {
        self.entries
    }
}

/// Cooperative cancellation shared between the engine and its caller
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Checked before every I/O and between pages.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Interactive decisions the engine asks its host to make
///
/// The engine never talks to a UI; picking a bootloader port, waving through
/// a board mismatch and exporting a UF2 artifact are capabilities the caller
/// injects.
pub trait HostCapabilities {
    /// Several candidate bootloader ports appeared; pick one or give up.
    fn pick_bootloader_port(&mut self, candidates: &[PortInfo]) -> Option<PortInfo>;

    /// The connected board does not match the selected profile. `true`
    /// proceeds anyway.
    fn confirm_board_mismatch(&mut self, port: &PortInfo, fqbn: &str) -> bool;

    /// Persist a download-style artifact for the user. Returns `false` when
    /// the host has nowhere to put it.
    fn export_artifact(&mut self, suggested_name: &str, data: &[u8]) -> Result<bool>;
}

/// Denies every interactive request; what a headless façade starts from.
#[derive(Debug, Default)]
pub struct NonInteractive;

impl HostCapabilities for NonInteractive {
    fn pick_bootloader_port(&mut self, _candidates: &[PortInfo]) -> Option<PortInfo> {
        None
    }

    fn confirm_board_mismatch(&mut self, _port: &PortInfo, _fqbn: &str) -> bool {
        false
    }

    fn export_artifact(&mut self, _suggested_name: &str, _data: &[u8]) -> Result<bool> {
        Ok(false)
    }
}

/// Everything one upload needs as input
#[derive(Debug)]
pub struct UploadRequest {
    pub profile: &'static Profile,
    /// Kept only for reporting; dispatch went through the profile already.
    pub fqbn: String,
    pub firmware: Vec<u8>,
    pub format_hint: FormatHint,
    pub port: PortInfo,
    /// Baud the monitor should come back at; falls back to
    /// `last_working_baud`, then the profile default.
    pub monitor_baud: Option<u32>,
    pub last_working_baud: Option<u32>,
}

impl UploadRequest {
    fn resolved_monitor_baud(&self) -> u32 {
        self.monitor_baud
            .or(self.last_working_baud)
            .unwrap_or(self.profile.monitor_default_baud)
    }
}

/// Where the upload ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadOutcome {
    Succeeded,
    Failed(ErrorKind),
    Cancelled,
}

/// The record every upload returns, success or not
#[derive(Debug, Serialize)]
pub struct UploadReport {
    pub session_id: u64,
    pub outcome: UploadOutcome,
    pub duration: Duration,
    pub bytes_written: u32,
    pub pages_written: u32,
    pub verify: Option<VerifyOutcome>,
    pub bootloader_version: Option<String>,
    pub monitor_baud: u32,
    pub log: Vec<DiagnosticEntry>,
}

impl UploadReport {
    pub fn success(&self) -> bool {
        self.outcome == UploadOutcome::Succeeded
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.outcome {
            UploadOutcome::Failed(kind) => Some(kind),
            UploadOutcome::Cancelled => Some(ErrorKind::Cancelled),
            UploadOutcome::Succeeded => None,
        }
    }
}

// Exclusive claim on a port for one session lifetime.
#[derive(Debug)]
struct SessionGuard {
    port: String,
}

impl SessionGuard {
    fn claim(port: &str) -> Result<Self> {
        let mut sessions = ACTIVE_SESSIONS.lock().unwrap();
        let sessions = sessions.get_or_insert_with(HashSet::new);
        if !sessions.insert(port.to_string()) {
            return Err(Error::SessionInProgress(port.to_string()));
        }
        Ok(SessionGuard {
            port: port.to_string(),
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut sessions = ACTIVE_SESSIONS.lock().unwrap();
        if let Some(sessions) = sessions.as_mut() {
            sessions.remove(&self.port);
        }
    }
}

/// Drives uploads one at a time
pub struct Uploader<'a> {
    caps: &'a mut dyn HostCapabilities,
    progress: &'a mut dyn ProgressCallbacks,
    cancel: CancelToken,
}

impl<'a> Uploader<'a> {
    pub fn new(
        caps: &'a mut dyn HostCapabilities,
        progress: &'a mut dyn ProgressCallbacks,
    ) -> Self {
        Uploader {
            caps,
            progress,
            cancel: CancelToken::new(),
        }
    }

    /// A clonable handle the caller can trip from a signal handler.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run one upload to completion. Never returns an error: failures are
    /// folded into the report and the monitor is resumed whenever it was
    /// paused.
    pub fn run(&mut self, request: UploadRequest, coupler: &mut MonitorCoupler) -> UploadReport {
        let session_id = SESSION_IDS.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut log = DiagnosticLog::new();
        // An explicit request wins; otherwise the monitor comes back at
        // whatever rate it was running before the upload.
        let monitor_baud = request
            .monitor_baud
            .or_else(|| coupler.current_baud())
            .unwrap_or_else(|| request.resolved_monitor_baud());
        let mut stats = ProgramStats::default();
        let mut verify = None;
        let mut version = None;
        let mut paused = false;

        let result = self.run_phases(
            &request,
            coupler,
            &mut log,
            &mut stats,
            &mut verify,
            &mut version,
            &mut paused,
        );

        // The user's serial view comes back no matter how the upload went,
        // unless the monitor was never paused (mismatch rejected, UF2).
        if paused {
            if let Err(err) = coupler.resume(monitor_baud, &request.port) {
                log.push(
                    Severity::Warning,
                    format!("could not resume the serial monitor: {err}"),
                );
            }
        }

        let outcome = match result {
            Ok(()) => UploadOutcome::Succeeded,
            Err(Error::Cancelled) => {
                log.push(Severity::Warning, "upload cancelled".into());
                UploadOutcome::Cancelled
            }
            Err(err) => {
                log.push(Severity::Error, err.to_string());
                UploadOutcome::Failed(err.kind())
            }
        };

        UploadReport {
            session_id,
            outcome,
            duration: started.elapsed(),
            bytes_written: stats.bytes_written,
            pages_written: stats.pages_written,
            verify,
            bootloader_version: version,
            monitor_baud,
            log: log.into_entries(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phases(
        &mut self,
        request: &UploadRequest,
        coupler: &mut MonitorCoupler,
        log: &mut DiagnosticLog,
        stats: &mut ProgramStats,
        verify: &mut Option<VerifyOutcome>,
        version: &mut Option<String>,
        paused: &mut bool,
    ) -> Result<()> {
        let profile = request.profile;

        // Parse first: a bad artifact must fail before any port is touched.
        let image = FirmwareImage::parse(
            &request.firmware,
            request.format_hint,
            profile.flash_layout(),
        )?;
        log.push(
            Severity::Info,
            format!(
                "parsed {} image: {} bytes at {:#06x}",
                image.format(),
                image.total_bytes(),
                image.start_address()
            ),
        );

        let _session = SessionGuard::claim(&request.port.name)?;
        let mut strategy = Strategy::select(profile);

        // Mass-storage bootloaders never touch the serial monitor.
        if let Strategy::Uf2(download) = &strategy {
            return download.prepare(&image, &mut *self.caps, log);
        }

        // Board mismatch is checked before the monitor is paused, so a
        // rejected mismatch leaves the user's serial view running.
        let known = !profile.app_vidpid.is_empty();
        if known
            && !request.port.matches(profile.app_vidpid)
            && !request.port.matches(profile.bootloader_vidpid)
        {
            if !self.caps.confirm_board_mismatch(&request.port, &request.fqbn) {
                return Err(Error::BoardMismatch {
                    port: request.port.name.clone(),
                    vid: request.port.vid,
                    pid: request.port.pid,
                    fqbn: request.fqbn.clone(),
                });
            }
            log.push(
                Severity::Warning,
                "board mismatch confirmed by the user, proceeding".into(),
            );
        }

        coupler.pause();
        coupler.release();
        *paused = true;

        let mut transport = self.reset_into_bootloader(request, log)?;

        let serial = match strategy.as_serial() {
            Some(serial) => serial,
            None => return Err(Error::UnsupportedStrategy(profile.family.to_string())),
        };

        {
            let mut ctx = StrategyCtx {
                link: &mut transport,
                progress: &mut *self.progress,
                cancel: &self.cancel,
                log,
            };

            serial.begin(&mut ctx)?;
            serial.program(&mut ctx, &image, stats)?;
            *verify = Some(serial.verify(&mut ctx, &image)?);
            serial.finish(&mut ctx)?;
        }
        *version = serial.bootloader_version().map(String::from);

        transport.close();

        if profile.uses_bootloader_port() {
            // Native-USB boards re-enumerate back to the sketch's port; give
            // them a moment so the monitor reopen does not race it.
            match ports::wait_for_match(profile.app_vidpid, APP_PORT_WAIT) {
                Ok(ports) if !ports.is_empty() => {
                    debug!("application port back as {}", ports[0].name)
                }
                _ => log.push(
                    Severity::Warning,
                    "application port did not reappear in time".into(),
                ),
            }
        }

        log.push(
            Severity::Info,
            format!(
                "wrote {} bytes in {} pages",
                stats.bytes_written, stats.pages_written
            ),
        );
        Ok(())
    }

    /// Reset per the profile and return an open transport on the
    /// programming port.
    fn reset_into_bootloader(
        &mut self,
        request: &UploadRequest,
        log: &mut DiagnosticLog,
    ) -> Result<SerialTransport> {
        let profile = request.profile;
        self.cancel.check()?;

        match profile.reset_method {
            ResetMethod::DtrPulse => {
                let mut transport = SerialTransport::open(&request.port, profile.program_baud)?;
                DtrPulseReset::new().reset(&mut transport)?;
                Ok(transport)
            }
            ResetMethod::None => {
                let mut transport = SerialTransport::open(&request.port, profile.program_baud)?;
                NoReset.reset(&mut transport)?;
                Ok(transport)
            }
            ResetMethod::Touch1200 => {
                SerialTransport::touch_1200(&request.port)?;
                log.push(
                    Severity::Info,
                    "waiting for the bootloader port to enumerate".into(),
                );

                let candidates =
                    ports::wait_for_match(profile.bootloader_vidpid, BOOTLOADER_WAIT)?;
                let port = resolve_bootloader_port(candidates, self.caps)?;
                log.push(Severity::Info, format!("bootloader port: {}", port.name));

                SerialTransport::open(&port, profile.program_baud)
            }
        }
    }
}

/// Decide which of the re-enumerated ports is the bootloader. A single
/// candidate is used as-is; anything else needs the host.
pub(crate) fn resolve_bootloader_port(
    candidates: Vec<PortInfo>,
    caps: &mut dyn HostCapabilities,
) -> Result<PortInfo> {
    match candidates.as_slice() {
        [] => Err(Error::BootloaderPortNeeded),
        [only] => Ok(only.clone()),
        _ => caps
            .pick_bootloader_port(&candidates)
            .ok_or(Error::BootloaderPortNeeded),
    }
}

/// Convenience wrapper resolving the profile from an FQBN.
pub fn request_for_fqbn(
    fqbn: &str,
    firmware: Vec<u8>,
    format_hint: FormatHint,
    port: PortInfo,
    monitor_baud: Option<u32>,
    last_working_baud: Option<u32>,
) -> Result<UploadRequest> {
    let profile = crate::boards::profile_for_fqbn(fqbn)
        .ok_or_else(|| Error::UnknownBoard(fqbn.to_string()))?;

    Ok(UploadRequest {
        profile,
        fqbn: fqbn.to_string(),
        firmware,
        format_hint,
        port,
        monitor_baud,
        last_working_baud,
    })
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
    fn single_bootloader_candidate_is_taken() {
        let mut caps = NonInteractive;
        let only = port(0x2341, 0x0069, "/dev/ttyACM1");

        let resolved = resolve_bootloader_port(vec![only.clone()], &mut caps).unwrap();
        assert_eq!(resolved, only);
    }

    #[test]
    fn ambiguous_candidates_without_picker_need_the_user() {
        let mut caps = NonInteractive;
        let candidates = vec![
            port(0x2341, 0x0069, "/dev/ttyACM1"),
            port(0x2341, 0x006D, "/dev/ttyACM2"),
        ];

        let err = resolve_bootloader_port(candidates, &mut caps).unwrap_err();
        assert!(matches!(err, Error::BootloaderPortNeeded));
    }

    #[test]
    fn no_candidates_need_the_user() {
        let mut caps = NonInteractive;
        let err = resolve_bootloader_port(Vec::new(), &mut caps).unwrap_err();
        assert!(matches!(err, Error::BootloaderPortNeeded));
    }

    #[test]
    fn second_session_on_same_port_is_refused() {
        let guard = SessionGuard::claim("/dev/ttyACM9").unwrap();
        let err = SessionGuard::claim("/dev/ttyACM9").unwrap_err();
        assert!(matches!(err, Error::SessionInProgress(_)));

        drop(guard);
        SessionGuard::claim("/dev/ttyACM9").unwrap();
    }

    #[test]
    fn cancel_token_trips_checks() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn monitor_baud_resolution_order() {
        let profile = crate::boards::profile_for_fqbn("arduino:avr:uno").unwrap();
        let base = UploadRequest {
            profile,
            fqbn: "arduino:avr:uno".into(),
            firmware: vec![0xFF],
            format_hint: FormatHint::RawBinary,
            port: port(0x2341, 0x0043, "/dev/ttyACM0"),
            monitor_baud: None,
            last_working_baud: None,
        };
        assert_eq!(base.resolved_monitor_baud(), 115_200);

        let hinted = UploadRequest {
            last_working_baud: Some(9_600),
            firmware: vec![0xFF],
            fqbn: base.fqbn.clone(),
            port: base.port.clone(),
            ..base
        };
        assert_eq!(hinted.resolved_monitor_baud(), 9_600);

        let explicit = UploadRequest {
            monitor_baud: Some(57_600),
            last_working_baud: Some(9_600),
            firmware: vec![0xFF],
            fqbn: hinted.fqbn.clone(),
            port: hinted.port.clone(),
            ..hinted
        };
        assert_eq!(explicit.resolved_monitor_baud(), 57_600);
    }
}
