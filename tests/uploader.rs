//! Orchestrator behavior that must hold before any serial I/O happens

use arduflash::{
    boards::profile_for_fqbn,
    error::{ErrorKind, Result},
    image::FormatHint,
    monitor::{CouplerState, MonitorCoupler},
    ports::PortInfo,
    progress::NoProgress,
    uploader::{
        HostCapabilities, NonInteractive, UploadOutcome, UploadRequest, Uploader,
    },
};

fn port(vid: u16, pid: u16, name: &str) -> PortInfo {
    PortInfo {
        name: name.to_string(),
        vid,
        pid,
        product: None,
        serial_number: None,
    }
}

fn request(
    fqbn: &str,
    firmware: Vec<u8>,
    hint: FormatHint,
    port: PortInfo,
) -> UploadRequest {
    UploadRequest {
        profile: profile_for_fqbn(fqbn).unwrap(),
        fqbn: fqbn.to_string(),
        firmware,
        format_hint: hint,
        port,
        monitor_baud: None,
        last_working_baud: None,
    }
}

#[test]
fn board_mismatch_is_reported_before_the_monitor_is_paused() {
    // A Mega answered on the port while an Uno profile was selected.
    let mega_port = port(0x2341, 0x0042, "/dev/ttyMISMATCH");
    let request = request(
        "arduino:avr:uno",
        vec![0x0C, 0x94, 0x34, 0x00],
        FormatHint::RawBinary,
        mega_port,
    );

    let mut caps = NonInteractive;
    let mut progress = NoProgress;
    let mut uploader = Uploader::new(&mut caps, &mut progress);
    let mut coupler = MonitorCoupler::new();

    let report = uploader.run(request, &mut coupler);

    assert_eq!(report.outcome, UploadOutcome::Failed(ErrorKind::BoardMismatch));
    assert_eq!(report.bytes_written, 0);
    // The monitor was never paused, so it was never resumed either.
    assert_eq!(coupler.state(), CouplerState::Released);
    assert_eq!(coupler.current_baud(), None);
}

#[test]
fn invalid_firmware_fails_before_any_port_is_opened() {
    let uno_port = port(0x2341, 0x0043, "/dev/ttyBADHEX");
    // Off-by-one checksum on the data record.
    let bad_hex = b":0400000001020304F3\n:00000001FF\n".to_vec();
    let request = request("arduino:avr:uno", bad_hex, FormatHint::IntelHex, uno_port);

    let mut caps = NonInteractive;
    let mut progress = NoProgress;
    let mut uploader = Uploader::new(&mut caps, &mut progress);
    let mut coupler = MonitorCoupler::new();

    let report = uploader.run(request, &mut coupler);

    assert_eq!(
        report.outcome,
        UploadOutcome::Failed(ErrorKind::FirmwareInvalid)
    );
    assert_eq!(report.pages_written, 0);
    assert_eq!(coupler.state(), CouplerState::Released);
}

#[test]
fn uf2_profile_without_export_capability_is_unsupported() {
    let pico_port = port(0x2E8A, 0x000A, "/dev/ttyPICO0");
    let request = request(
        "rp2040:rp2040:rpipico",
        uf2_block(),
        FormatHint::Uf2,
        pico_port,
    );

    let mut caps = NonInteractive;
    let mut progress = NoProgress;
    let mut uploader = Uploader::new(&mut caps, &mut progress);
    let mut coupler = MonitorCoupler::new();

    let report = uploader.run(request, &mut coupler);

    assert_eq!(
        report.outcome,
        UploadOutcome::Failed(ErrorKind::UnsupportedStrategy)
    );
    assert_eq!(coupler.state(), CouplerState::Released);
}

/// Accepts the artifact and remembers it.
#[derive(Default)]
struct CapturingHost {
    artifact: Option<(String, usize)>,
}

impl HostCapabilities for CapturingHost {
    fn pick_bootloader_port(&mut self, _candidates: &[PortInfo]) -> Option<PortInfo> {
        None
    }

    fn confirm_board_mismatch(&mut self, _port: &PortInfo, _fqbn: &str) -> bool {
        false
    }

    fn export_artifact(&mut self, suggested_name: &str, data: &[u8]) -> Result<bool> {
        self.artifact = Some((suggested_name.to_string(), data.len()));
        Ok(true)
    }
}

#[test]
fn uf2_profile_exports_without_touching_the_monitor() {
    let pico_port = port(0x2E8A, 0x000A, "/dev/ttyPICO1");
    let request = request(
        "rp2040:rp2040:rpipico",
        uf2_block(),
        FormatHint::Uf2,
        pico_port,
    );

    let mut caps = CapturingHost::default();
    let mut progress = NoProgress;
    let mut uploader = Uploader::new(&mut caps, &mut progress);
    let mut coupler = MonitorCoupler::new();

    let report = uploader.run(request, &mut coupler);

    assert!(report.success());
    assert_eq!(coupler.state(), CouplerState::Released);
    let (name, size) = caps.artifact.expect("artifact not exported");
    assert!(name.ends_with(".uf2"));
    assert_eq!(size, 512);
}

fn uf2_block() -> Vec<u8> {
    let mut block = vec![0u8; 512];
    block[0..4].copy_from_slice(&0x0A32_4655u32.to_le_bytes());
    block[4..8].copy_from_slice(&0x9E5D_5157u32.to_le_bytes());
    block[16..20].copy_from_slice(&256u32.to_le_bytes());
    block[508..512].copy_from_slice(&0x0AB1_6F30u32.to_le_bytes());
    block
}
