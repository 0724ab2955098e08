//! UF2 container validation
//!
//! UF2 artifacts are never programmed over serial; they are handed back to
//! the host for a mass-storage bootloader copy. Validation is limited to the
//! magic words and the 512-byte block structure.

use crate::error::ParseError;

const BLOCK_SIZE: usize = 512;
const MAGIC_START0: u32 = 0x0A32_4655; // "UF2\n"
const MAGIC_START1: u32 = 0x9E5D_5157;
const MAGIC_END: u32 = 0x0AB1_6F30;

pub(super) fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 8
        && read_u32(bytes, 0) == MAGIC_START0
        && read_u32(bytes, 4) == MAGIC_START1
}

/// Check that `bytes` is a well-formed UF2 container.
pub fn validate_uf2(bytes: &[u8]) -> Result<(), ParseError> {
    if bytes.is_empty() || bytes.len() % BLOCK_SIZE != 0 {
        return Err(ParseError::InvalidUf2);
    }

    for block in bytes.chunks_exact(BLOCK_SIZE) {
        if read_u32(block, 0) != MAGIC_START0
            || read_u32(block, 4) != MAGIC_START1
            || read_u32(block, BLOCK_SIZE - 4) != MAGIC_END
        {
            return Err(ParseError::InvalidUf2);
        }

        // Payload size lives at offset 16 and must fit the 476-byte data area.
        let payload = read_u32(block, 16);
        if payload as usize > 476 {
            return Err(ParseError::InvalidUf2);
        }
    }

    Ok(())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

#[cfg(test)]
mod test {
    use super::*;

    fn block(payload: u32) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[0..4].copy_from_slice(&MAGIC_START0.to_le_bytes());
        block[4..8].copy_from_slice(&MAGIC_START1.to_le_bytes());
        block[16..20].copy_from_slice(&payload.to_le_bytes());
        block[BLOCK_SIZE - 4..].copy_from_slice(&MAGIC_END.to_le_bytes());
        block
    }

    #[test]
    fn well_formed_container_passes() {
        let mut data = block(256);
        data.extend(block(256));
        assert!(validate_uf2(&data).is_ok());
    }

    #[test]
    fn ragged_length_fails() {
        let mut data = block(256);
        data.truncate(500);
        assert_eq!(validate_uf2(&data), Err(ParseError::InvalidUf2));
    }

    #[test]
    fn corrupted_end_magic_fails() {
        let mut data = block(256);
        data[BLOCK_SIZE - 1] ^= 0xFF;
        assert_eq!(validate_uf2(&data), Err(ParseError::InvalidUf2));
    }

    #[test]
    fn oversized_payload_fails() {
        assert_eq!(validate_uf2(&block(512)), Err(ParseError::InvalidUf2));
    }
}
