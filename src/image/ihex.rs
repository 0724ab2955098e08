//! Intel HEX record parser
//!
//! Supports the record types emitted by the Arduino toolchains: 00 (data),
//! 01 (EOF), 02 (extended segment address) and 04 (extended linear address).
//! Every record's checksum is validated before any byte is accepted.

use crate::error::ParseError;

use super::Segment;

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXT_SEGMENT: u8 = 0x02;
const RECORD_EXT_LINEAR: u8 = 0x04;

/// Parse Intel HEX text into address-ordered segments.
///
/// Adjacent records are merged into one segment; a gap or an address
/// extension starts a new segment. Returns no partial result: the first
/// invalid record fails the whole parse.
pub(super) fn parse(bytes: &[u8]) -> Result<Vec<Segment>, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ParseError::MalformedRecord { line: 1 })?;

    let mut segments: Vec<Segment> = Vec::new();
    let mut upper: u32 = 0;
    let mut seen_eof = false;

    for (index, raw_line) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw_line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen_eof {
            // Trailing garbage after the EOF record.
            return Err(ParseError::MalformedRecord { line });
        }

        let record = Record::parse(trimmed, line)?;
        match record.record_type {
            RECORD_DATA => {
                let address = upper + record.offset as u32;
                append(&mut segments, address, &record.data);
            }
            RECORD_EOF => {
                if !record.data.is_empty() {
                    return Err(ParseError::MalformedRecord { line });
                }
                seen_eof = true;
            }
            RECORD_EXT_SEGMENT => {
                if record.data.len() != 2 {
                    return Err(ParseError::MalformedRecord { line });
                }
                upper = u32::from(u16::from_be_bytes([record.data[0], record.data[1]])) << 4;
            }
            RECORD_EXT_LINEAR => {
                if record.data.len() != 2 {
                    return Err(ParseError::MalformedRecord { line });
                }
                upper = u32::from(u16::from_be_bytes([record.data[0], record.data[1]])) << 16;
            }
            record_type => {
                return Err(ParseError::UnsupportedRecord { line, record_type });
            }
        }
    }

    if !seen_eof {
        return Err(ParseError::MalformedRecord {
            line: text.lines().count(),
        });
    }

    Ok(segments)
}

fn append(segments: &mut Vec<Segment>, address: u32, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    match segments.last_mut() {
        Some(last) if last.end() == address => last.data.extend_from_slice(data),
        _ => segments.push(Segment {
            addr: address,
            data: data.to_vec(),
        }),
    }
}

struct Record {
    offset: u16,
    record_type: u8,
    data: Vec<u8>,
}

impl Record {
    fn parse(line_text: &str, line: usize) -> Result<Self, ParseError> {
        let body = line_text
            .strip_prefix(':')
            .ok_or(ParseError::MalformedRecord { line })?;
        // Colon, then pairs of hex digits: count, offset (2), type, data, checksum.
        if body.len() % 2 != 0 || body.len() < 10 {
            return Err(ParseError::MalformedRecord { line });
        }

        let mut bytes = Vec::with_capacity(body.len() / 2);
        for pair in body.as_bytes().chunks(2) {
            let pair = std::str::from_utf8(pair).map_err(|_| ParseError::MalformedRecord { line })?;
            let byte =
                u8::from_str_radix(pair, 16).map_err(|_| ParseError::MalformedRecord { line })?;
            bytes.push(byte);
        }

        let count = bytes[0] as usize;
        if bytes.len() != count + 5 {
            return Err(ParseError::MalformedRecord { line });
        }

        let sum = bytes.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte));
        if sum != 0 {
            return Err(ParseError::InvalidChecksum { line });
        }

        Ok(Record {
            offset: u16::from_be_bytes([bytes[1], bytes[2]]),
            record_type: bytes[3],
            data: bytes[4..4 + count].to_vec(),
        })
    }
}
