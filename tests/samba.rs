//! SAM-BA wire-protocol behavior against a scripted bootloader

mod common;

use arduflash::{
    boards::profile_for_fqbn,
    error::Error,
    image::{FirmwareImage, FormatHint},
    progress::NoProgress,
    strategy::{ProgramStats, SamBa, StrategyCtx, UploadStrategy, VerifyOutcome},
    uploader::{CancelToken, DiagnosticLog},
};
use common::{LinkEvent, ScriptedLink};
use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const LINE_END: &[u8] = b"\n\r";
const VERSION: &str = "Arduino Bootloader (SAM-BA extended) 2.0 [Arduino:IKXYZ]";

/// The 52-byte applet staged at 0x20001000, as scripted writes observe it.
const APPLET_LEN: usize = 52;

fn r4_image(bytes: usize) -> FirmwareImage {
    let profile = profile_for_fqbn("arduino:renesas_uno:unor4wifi").unwrap();
    let firmware: Vec<u8> = (0..bytes).map(|i| (i % 253) as u8).collect();
    FirmwareImage::parse(&firmware, FormatHint::RawBinary, profile.flash_layout()).unwrap()
}

fn reply(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.extend_from_slice(LINE_END);
    bytes
}

fn expect_handshake(link: &mut ScriptedLink) {
    link.expect("N#", LINE_END);
    link.expect("V#", reply(VERSION));
    link.expect("I#", reply("Arduino UNO R4 WiFi"));
}

fn expect_chunk(link: &mut ScriptedLink, image: &FirmwareImage, index: usize, with_applet: bool) {
    let chunk_size = 4096usize;
    let offset = index * chunk_size;
    let chunk = &image.linear_image()[offset..(offset + chunk_size).min(image.linear_image().len())];
    let destination = image.start_address() + offset as u32;

    if with_applet {
        link.expect(format!("S20001000,{APPLET_LEN:08X}#"), []);
        // The applet bytes themselves stream as one raw write.
        link.expect_raw_len(APPLET_LEN);
    }

    link.expect(format!("W20001034,{destination:08X}#"), []);
    link.expect("W20001038,20002000#", []);
    link.expect(format!("W2000103C,{:08X}#", chunk.len()), []);
    link.expect("X20001000#", []);
    link.expect(format!("S20002000,{:08X}#", chunk.len()), []);
    link.expect(chunk, []);

    let crc = CRC32.checksum(chunk);
    link.expect(format!("Y{destination:08X},{crc:08X}#"), LINE_END);
}

fn drive(
    driver: &mut SamBa,
    link: &mut ScriptedLink,
    image: &FirmwareImage,
) -> Result<ProgramStats, Error> {
    let cancel = CancelToken::new();
    let mut progress = NoProgress;
    let mut log = DiagnosticLog::new();
    let mut stats = ProgramStats::default();

    let mut ctx = StrategyCtx {
        link,
        progress: &mut progress,
        cancel: &cancel,
        log: &mut log,
    };
    driver.begin(&mut ctx)?;
    driver.program(&mut ctx, image, &mut stats)?;
    assert_eq!(driver.verify(&mut ctx, image)?, VerifyOutcome::Passed);
    driver.finish(&mut ctx)?;
    Ok(stats)
}

#[test]
fn two_chunk_upload_follows_the_captured_sequence() {
    let profile = profile_for_fqbn("arduino:renesas_uno:unor4wifi").unwrap();
    let image = r4_image(8192);
    let mut link = ScriptedLink::new(230_400);

    expect_handshake(&mut link);
    expect_chunk(&mut link, &image, 0, true);
    expect_chunk(&mut link, &image, 1, false);

    let mut driver = SamBa::new(profile);
    let stats = drive(&mut driver, &mut link, &image).unwrap();

    assert_eq!(stats.pages_written, 2);
    assert_eq!(stats.bytes_written, 8192);
    assert_eq!(driver.bootloader_version(), Some(VERSION));

    // The reopen at the programming baud happens even though the port is
    // already open at that rate; it forces the second SET_LINE_CODING.
    assert!(link
        .events
        .iter()
        .any(|event| *event == LinkEvent::ReopenAt(230_400)));
    link.assert_done();
}

#[test]
fn command_fields_are_always_uppercase_hex() {
    let profile = profile_for_fqbn("arduino:renesas_uno:unor4wifi").unwrap();
    let image = r4_image(4096);
    let mut link = ScriptedLink::new(230_400);

    expect_handshake(&mut link);
    expect_chunk(&mut link, &image, 0, true);

    let mut driver = SamBa::new(profile);
    drive(&mut driver, &mut link, &image).unwrap();

    for command in link.written_strings() {
        if !command.ends_with('#') {
            continue;
        }
        // A lowercase hex digit anywhere in a command is a regression.
        let fields = &command[1..command.len() - 1];
        assert!(
            !fields.chars().any(|ch| ('a'..='f').contains(&ch)),
            "lowercase hex leaked into {command:?}"
        );
    }
    link.assert_done();
}

#[test]
fn handshake_reopens_and_retries_after_a_silent_cycle() {
    let profile = profile_for_fqbn("arduino:renesas_uno:unor4wifi").unwrap();
    let mut link = ScriptedLink::new(230_400);

    link.expect("N#", []);
    link.expect("N#", LINE_END);
    link.expect("V#", reply(VERSION));
    link.expect("I#", reply("Arduino UNO R4 WiFi"));

    let mut driver = SamBa::new(profile);
    let cancel = CancelToken::new();
    let mut progress = NoProgress;
    let mut log = DiagnosticLog::new();
    let mut ctx = StrategyCtx {
        link: &mut link,
        progress: &mut progress,
        cancel: &cancel,
        log: &mut log,
    };

    driver.begin(&mut ctx).unwrap();

    let reopens = link
        .events
        .iter()
        .filter(|event| **event == LinkEvent::ReopenAt(230_400))
        .count();
    // One initial reopen plus one retry cycle.
    assert_eq!(reopens, 2);
    link.assert_done();
}

#[test]
fn three_silent_cycles_fail_the_handshake() {
    let profile = profile_for_fqbn("arduino:renesas_uno:unor4wifi").unwrap();
    let mut link = ScriptedLink::new(230_400);
    for _ in 0..3 {
        link.expect("N#", []);
    }

    let mut driver = SamBa::new(profile);
    let cancel = CancelToken::new();
    let mut progress = NoProgress;
    let mut log = DiagnosticLog::new();
    let mut ctx = StrategyCtx {
        link: &mut link,
        progress: &mut progress,
        cancel: &cancel,
        log: &mut log,
    };

    let err = driver.begin(&mut ctx).unwrap_err();
    assert!(matches!(err, Error::SyncFailed));
    link.assert_done();
}

#[test]
fn chunk_crc_mismatch_is_a_verify_failure() {
    let profile = profile_for_fqbn("arduino:renesas_uno:unor4wifi").unwrap();
    let image = r4_image(4096);
    let mut link = ScriptedLink::new(230_400);

    expect_handshake(&mut link);

    let chunk = image.linear_image();
    let destination = image.start_address();
    link.expect(format!("S20001000,{APPLET_LEN:08X}#"), []);
    link.expect_raw_len(APPLET_LEN);
    link.expect(format!("W20001034,{destination:08X}#"), []);
    link.expect("W20001038,20002000#", []);
    link.expect(format!("W2000103C,{:08X}#", chunk.len()), []);
    link.expect("X20001000#", []);
    link.expect(format!("S20002000,{:08X}#", chunk.len()), []);
    link.expect(chunk, []);
    // The bootloader disagrees about the CRC.
    let crc = CRC32.checksum(chunk);
    link.expect(format!("Y{destination:08X},{crc:08X}#"), "ERR\n\r");

    let mut driver = SamBa::new(profile);
    let err = drive(&mut driver, &mut link, &image).unwrap_err();
    assert!(matches!(err, Error::VerifyFailed { .. }));
    link.assert_done();
}
