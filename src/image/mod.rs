//! Firmware artifact parsing and paging
//!
//! [FirmwareImage] is the format-agnostic representation the upload
//! strategies program from: an ordered set of address/data segments plus a
//! linearized byte image padded with 0xFF to the flash page boundary.

use std::borrow::Cow;

use crc::{Crc, CRC_32_ISO_HDLC};
use strum::Display;

use crate::error::ParseError;

mod ihex;
mod uf2;

pub use uf2::validate_uf2;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Supported firmware artifact formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ImageFormat {
    IntelHex,
    RawBinary,
    Uf2,
}

/// Caller-supplied hint for [`FirmwareImage::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatHint {
    /// Detect from content: leading `:` means Intel HEX, the UF2 magic means
    /// UF2, anything else is taken as raw binary.
    #[default]
    Auto,
    IntelHex,
    RawBinary,
    Uf2,
}

/// The flash geometry an image is parsed against, taken from the board
/// profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    /// First programmable address.
    pub base: u32,
    /// Total flash bytes available to the application.
    pub size: u32,
    /// Smallest erase/program unit.
    pub page_size: u32,
}

impl FlashLayout {
    fn contains(&self, address: u32) -> bool {
        address >= self.base && address < self.base + self.size
    }
}

/// A contiguous run of firmware bytes at a flash address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub addr: u32,
    pub data: Vec<u8>,
}

impl Segment {
    fn end(&self) -> u32 {
        self.addr + self.data.len() as u32
    }
}

/// A parsed firmware artifact
///
/// Created once per upload and immutable afterwards. The linear image starts
/// at the lowest segment address and is padded with 0xFF so that its length
/// is a multiple of the flash page size.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    format: ImageFormat,
    segments: Vec<Segment>,
    linear: Vec<u8>,
    start_address: u32,
}

impl FirmwareImage {
    /// Parse a firmware artifact against the given flash layout.
    pub fn parse(
        bytes: &[u8],
        hint: FormatHint,
        layout: FlashLayout,
    ) -> Result<Self, ParseError> {
        if bytes.is_empty() {
            return Err(ParseError::Empty);
        }

        let format = detect_format(bytes, hint);
        match format {
            ImageFormat::IntelHex => {
                let segments = ihex::parse(bytes)?;
                Self::from_segments(ImageFormat::IntelHex, segments, layout)
            }
            ImageFormat::RawBinary => {
                if bytes.len() as u32 > layout.size {
                    return Err(ParseError::TooBig {
                        size: bytes.len(),
                        flash_size: layout.size,
                    });
                }
                let segments = vec![Segment {
                    addr: layout.base,
                    data: bytes.to_vec(),
                }];
                Self::from_segments(ImageFormat::RawBinary, segments, layout)
            }
            ImageFormat::Uf2 => {
                uf2::validate_uf2(bytes)?;
                // UF2 stays opaque: the strategy hands the blob back to the
                // host, it is never paged onto a serial bootloader.
                Ok(FirmwareImage {
                    format: ImageFormat::Uf2,
                    segments: Vec::new(),
                    linear: bytes.to_vec(),
                    start_address: 0,
                })
            }
        }
    }

    fn from_segments(
        format: ImageFormat,
        mut segments: Vec<Segment>,
        layout: FlashLayout,
    ) -> Result<Self, ParseError> {
        segments.sort_by_key(|segment| segment.addr);
        segments.retain(|segment| !segment.data.is_empty());

        if segments.is_empty() {
            return Err(ParseError::Empty);
        }

        for segment in &segments {
            if !layout.contains(segment.addr) || !layout.contains(segment.end() - 1) {
                return Err(ParseError::OutOfRange {
                    address: segment.addr,
                });
            }
        }
        for pair in segments.windows(2) {
            if pair[1].addr < pair[0].end() {
                return Err(ParseError::OverlappingSegments {
                    address: pair[1].addr,
                });
            }
        }

        let start_address = segments[0].addr;
        let end_address = segments
            .iter()
            .map(Segment::end)
            .max()
            .unwrap_or(start_address);
        let span = (end_address - start_address) as usize;
        let padded = span.next_multiple_of(layout.page_size as usize);

        let mut linear = vec![0xFF; padded];
        for segment in &segments {
            let offset = (segment.addr - start_address) as usize;
            linear[offset..offset + segment.data.len()].copy_from_slice(&segment.data);
        }

        Ok(FirmwareImage {
            format,
            segments,
            linear,
            start_address,
        })
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The linearized image, 0xFF-padded to a page boundary.
    pub fn linear_image(&self) -> &[u8] {
        &self.linear
    }

    pub fn start_address(&self) -> u32 {
        self.start_address
    }

    /// One past the last padded byte.
    pub fn end_address(&self) -> u32 {
        self.start_address + self.linear.len() as u32
    }

    /// Bytes defined by the artifact itself, excluding pad bytes.
    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(|segment| segment.data.len()).sum()
    }

    /// Iterate the linear image as full pages of exactly `page_size` bytes.
    pub fn page_iter(&self, page_size: u32) -> PageIter<'_> {
        PageIter {
            image: self,
            page_size: page_size as usize,
            offset: 0,
        }
    }

    /// CRC-32 over the linear image, as requested by CRC verify policies.
    pub fn crc32(&self) -> u32 {
        CRC32.checksum(&self.linear)
    }
}

/// Lazy page sequence over a [FirmwareImage]
pub struct PageIter<'a> {
    image: &'a FirmwareImage,
    page_size: usize,
    offset: usize,
}

/// A single flash page
pub struct Page<'a> {
    pub addr: u32,
    pub data: Cow<'a, [u8]>,
}

impl Page<'_> {
    /// Pages of pure pad bytes may be skipped by a strategy.
    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|byte| *byte == 0xFF)
    }
}

impl<'a> Iterator for PageIter<'a> {
    type Item = Page<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let linear = self.image.linear_image();
        if self.offset >= linear.len() {
            return None;
        }

        let addr = self.image.start_address() + self.offset as u32;
        let end = (self.offset + self.page_size).min(linear.len());
        let mut data = Cow::Borrowed(&linear[self.offset..end]);
        if data.len() < self.page_size {
            // The linear image is already page padded; this only trips when a
            // caller pages with a size other than the parse-time page size.
            let mut owned = data.into_owned();
            owned.resize(self.page_size, 0xFF);
            data = Cow::Owned(owned);
        }
        self.offset = end;

        Some(Page { addr, data })
    }
}

fn detect_format(bytes: &[u8], hint: FormatHint) -> ImageFormat {
    match hint {
        FormatHint::IntelHex => ImageFormat::IntelHex,
        FormatHint::RawBinary => ImageFormat::RawBinary,
        FormatHint::Uf2 => ImageFormat::Uf2,
        FormatHint::Auto => {
            if bytes.first() == Some(&b':') {
                ImageFormat::IntelHex
            } else if uf2::has_magic(bytes) {
                ImageFormat::Uf2
            } else {
                ImageFormat::RawBinary
            }
        }
    }
}
