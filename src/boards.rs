//! Board profiles and FQBN resolution
//!
//! A [Profile] is the dispatch key for the whole upload engine: it names the
//! bootloader protocol, the programming baud rate, the reset method and the
//! flash geometry. FQBN strings are only ever used to look a profile up.

use serde::Serialize;
use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::image::FlashLayout;

/// Board families with a shipped profile
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, VariantNames, Serialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "kebab-case")]
pub enum Family {
    Uno,
    Nano,
    Mega2560,
    UnoR4Minima,
    UnoR4Wifi,
    MkrZero,
    MkrWifi1010,
    Nano33Iot,
    RpiPico,
    Teensy40,
}

/// Which protocol driver programs the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
pub enum StrategyTag {
    Stk500V1,
    Stk500V2,
    SamBa,
    Uf2Download,
}

/// How the board is moved into its bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
pub enum ResetMethod {
    None,
    DtrPulse,
    Touch1200,
}

/// Post-program verification the profile requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
pub enum VerifyPolicy {
    None,
    ReadbackCompare,
    CrcAfterWrite,
}

/// Everything the engine needs to know about one board family
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub family: Family,
    pub strategy: StrategyTag,
    pub program_baud: u32,
    pub monitor_default_baud: u32,
    pub reset_method: ResetMethod,
    /// VID/PID pairs the board presents while running a sketch.
    pub app_vidpid: &'static [(u16, u16)],
    /// VID/PID pairs of the bootloader port; non-empty exactly when
    /// `reset_method` is the 1200-baud touch.
    pub bootloader_vidpid: &'static [(u16, u16)],
    pub page_size: u32,
    pub flash_size: u32,
    pub flash_base: u32,
    pub verify: VerifyPolicy,
    pub post_upload_reset: bool,
    /// Expected AVR device signature, checked during the STK500 handshake.
    pub signature: Option<[u8; 3]>,
}

impl Profile {
    pub fn flash_layout(&self) -> FlashLayout {
        FlashLayout {
            base: self.flash_base,
            size: self.flash_size,
            page_size: self.page_size,
        }
    }

    /// Whether the board re-enumerates on a different port for programming.
    pub fn uses_bootloader_port(&self) -> bool {
        self.reset_method == ResetMethod::Touch1200
    }
}

const UNO: Profile = Profile {
    family: Family::Uno,
    strategy: StrategyTag::Stk500V1,
    program_baud: 115_200,
    monitor_default_baud: 115_200,
    reset_method: ResetMethod::DtrPulse,
    app_vidpid: &[(0x2341, 0x0043), (0x2341, 0x0001), (0x2A03, 0x0043)],
    bootloader_vidpid: &[],
    page_size: 128,
    flash_size: 32_768,
    flash_base: 0,
    verify: VerifyPolicy::None,
    post_upload_reset: false,
    signature: Some([0x1E, 0x95, 0x0F]),
};

const NANO: Profile = Profile {
    family: Family::Nano,
    strategy: StrategyTag::Stk500V1,
    // Old-bootloader Nanos speak 57600; the profile carries the rate so the
    // strategy never hard-codes one.
    program_baud: 57_600,
    monitor_default_baud: 115_200,
    reset_method: ResetMethod::DtrPulse,
    app_vidpid: &[(0x0403, 0x6001), (0x1A86, 0x7523)],
    bootloader_vidpid: &[],
    page_size: 128,
    flash_size: 32_768,
    flash_base: 0,
    verify: VerifyPolicy::None,
    post_upload_reset: false,
    signature: Some([0x1E, 0x95, 0x0F]),
};

const MEGA2560: Profile = Profile {
    family: Family::Mega2560,
    strategy: StrategyTag::Stk500V2,
    program_baud: 115_200,
    monitor_default_baud: 115_200,
    reset_method: ResetMethod::DtrPulse,
    app_vidpid: &[(0x2341, 0x0042), (0x2341, 0x0010), (0x2A03, 0x0042)],
    bootloader_vidpid: &[],
    page_size: 256,
    flash_size: 262_144,
    flash_base: 0,
    verify: VerifyPolicy::ReadbackCompare,
    post_upload_reset: false,
    signature: Some([0x1E, 0x98, 0x01]),
};

const UNO_R4_MINIMA: Profile = Profile {
    family: Family::UnoR4Minima,
    strategy: StrategyTag::SamBa,
    program_baud: 230_400,
    monitor_default_baud: 115_200,
    reset_method: ResetMethod::Touch1200,
    app_vidpid: &[(0x2341, 0x0069)],
    bootloader_vidpid: &[(0x2341, 0x006D)],
    page_size: 256,
    flash_size: 262_144,
    flash_base: 0x4000,
    verify: VerifyPolicy::CrcAfterWrite,
    post_upload_reset: true,
    signature: None,
};

const UNO_R4_WIFI: Profile = Profile {
    family: Family::UnoR4Wifi,
    strategy: StrategyTag::SamBa,
    program_baud: 230_400,
    monitor_default_baud: 115_200,
    reset_method: ResetMethod::Touch1200,
    app_vidpid: &[(0x2341, 0x1002)],
    bootloader_vidpid: &[(0x2341, 0x0069), (0x2341, 0x006D)],
    page_size: 256,
    flash_size: 262_144,
    flash_base: 0x4000,
    verify: VerifyPolicy::CrcAfterWrite,
    post_upload_reset: true,
    signature: None,
};

const MKR_ZERO: Profile = Profile {
    family: Family::MkrZero,
    strategy: StrategyTag::SamBa,
    program_baud: 230_400,
    monitor_default_baud: 115_200,
    reset_method: ResetMethod::Touch1200,
    app_vidpid: &[(0x2341, 0x804F)],
    bootloader_vidpid: &[(0x2341, 0x004F)],
    page_size: 256,
    flash_size: 262_144,
    flash_base: 0x2000,
    verify: VerifyPolicy::CrcAfterWrite,
    post_upload_reset: true,
    signature: None,
};

const MKR_WIFI_1010: Profile = Profile {
    family: Family::MkrWifi1010,
    strategy: StrategyTag::SamBa,
    program_baud: 230_400,
    monitor_default_baud: 115_200,
    reset_method: ResetMethod::Touch1200,
    app_vidpid: &[(0x2341, 0x8054)],
    bootloader_vidpid: &[(0x2341, 0x0054)],
    page_size: 256,
    flash_size: 262_144,
    flash_base: 0x2000,
    verify: VerifyPolicy::CrcAfterWrite,
    post_upload_reset: true,
    signature: None,
};

const NANO_33_IOT: Profile = Profile {
    family: Family::Nano33Iot,
    strategy: StrategyTag::SamBa,
    program_baud: 230_400,
    monitor_default_baud: 115_200,
    reset_method: ResetMethod::Touch1200,
    app_vidpid: &[(0x2341, 0x8057)],
    bootloader_vidpid: &[(0x2341, 0x0057)],
    page_size: 256,
    flash_size: 262_144,
    flash_base: 0x2000,
    verify: VerifyPolicy::CrcAfterWrite,
    post_upload_reset: true,
    signature: None,
};

const RPI_PICO: Profile = Profile {
    family: Family::RpiPico,
    strategy: StrategyTag::Uf2Download,
    program_baud: 115_200,
    monitor_default_baud: 115_200,
    reset_method: ResetMethod::None,
    app_vidpid: &[(0x2E8A, 0x000A), (0x2E8A, 0x00C0)],
    bootloader_vidpid: &[],
    page_size: 256,
    flash_size: 2_097_152,
    flash_base: 0x1000_0000,
    verify: VerifyPolicy::None,
    post_upload_reset: false,
    signature: None,
};

const TEENSY40: Profile = Profile {
    family: Family::Teensy40,
    strategy: StrategyTag::Uf2Download,
    program_baud: 115_200,
    monitor_default_baud: 115_200,
    reset_method: ResetMethod::None,
    app_vidpid: &[(0x16C0, 0x0483)],
    bootloader_vidpid: &[],
    page_size: 512,
    flash_size: 2_031_616,
    flash_base: 0x6000_0000,
    verify: VerifyPolicy::None,
    post_upload_reset: false,
    signature: None,
};

/// FQBN prefix → profile. Longer prefixes win where families share a vendor.
const FQBN_TABLE: &[(&str, &Profile)] = &[
    ("arduino:avr:uno", &UNO),
    ("arduino:avr:nano", &NANO),
    ("arduino:avr:mega", &MEGA2560),
    ("arduino:renesas_uno:minima", &UNO_R4_MINIMA),
    ("arduino:renesas_uno:unor4wifi", &UNO_R4_WIFI),
    ("arduino:samd:mkrzero", &MKR_ZERO),
    ("arduino:samd:mkrwifi1010", &MKR_WIFI_1010),
    ("arduino:samd:nano_33_iot", &NANO_33_IOT),
    ("arduino:mbed_rp2040:pico", &RPI_PICO),
    ("rp2040:rp2040:rpipico", &RPI_PICO),
    ("teensy:avr:teensy40", &TEENSY40),
];

/// Resolve an FQBN to a board profile; variants after the third colon field
/// (e.g. `cpu=atmega328old`) are ignored for dispatch.
pub fn profile_for_fqbn(fqbn: &str) -> Option<&'static Profile> {
    let fqbn = fqbn.trim();
    let mut best: Option<(&str, &'static Profile)> = None;

    for (prefix, profile) in FQBN_TABLE {
        if fqbn == *prefix || fqbn.starts_with(&format!("{prefix}:")) {
            match best {
                Some((current, _)) if current.len() >= prefix.len() => {}
                _ => best = Some((prefix, profile)),
            }
        }
    }

    best.map(|(_, profile)| profile)
}

/// Every shipped profile, for listings.
pub fn all_profiles() -> &'static [(&'static str, &'static Profile)] {
    FQBN_TABLE
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fqbn_lookup_is_prefix_based() {
        assert_eq!(
            profile_for_fqbn("arduino:avr:uno").unwrap().family,
            Family::Uno
        );
        assert_eq!(
            profile_for_fqbn("arduino:avr:nano:cpu=atmega328old")
                .unwrap()
                .family,
            Family::Nano
        );
        assert!(profile_for_fqbn("esp32:esp32:esp32").is_none());
    }

    #[test]
    fn touch_reset_profiles_carry_bootloader_ids() {
        for (_, profile) in all_profiles() {
            let has_bootloader_ids = !profile.bootloader_vidpid.is_empty();
            assert_eq!(
                profile.uses_bootloader_port(),
                has_bootloader_ids,
                "profile {:?} violates the bootloader VID/PID invariant",
                profile.family
            );
        }
    }

    #[test]
    fn sam_ba_profiles_program_at_230400() {
        for (_, profile) in all_profiles() {
            if profile.strategy == StrategyTag::SamBa {
                assert_eq!(profile.program_baud, 230_400);
            }
        }
    }

    #[test]
    fn linear_images_page_align_per_profile() {
        for (_, profile) in all_profiles() {
            assert!(profile.page_size.is_power_of_two());
            assert_eq!(profile.flash_size % profile.page_size, 0);
        }
    }
}
