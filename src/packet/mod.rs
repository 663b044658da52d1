//! Packet layouts
//!
//! A [`PacketLayout`] is the ordered list of sections making up one
//! protocol's packet on the wire:
//!
//! ```text
//! ┌────────┬────────┬─────────┬──────────┬──────────┬────────┐
//! │ Header │ Length │ Command │ Data     │ Checksum │ Footer │
//! │ marker │ 1/2/4  │ N bytes │ variable │ N bytes  │ marker │
//! └────────┴────────┴─────────┴──────────┴──────────┴────────┘
//! ```
//!
//! Only the header is mandatory and it must come first; every other
//! section is optional and may appear at most once. The layout is checked
//! once at construction and is immutable afterwards.

pub mod checksum;
pub mod message;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use checksum::{BuiltinChecksum, ChecksumAlgorithm, ChecksumValidator, CoveredBytes};
pub use message::{CommandSpec, CommandTable, Message, MessageFactory, TableMessage};

/// Byte order of a multi-byte field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Most significant byte first (big-endian).
    #[default]
    Msb,
    /// Least significant byte first (little-endian).
    Lsb,
}

/// Section kinds, without their parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Header,
    Length,
    Command,
    Data,
    Checksum,
    Footer,
    Other,
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SectionKind::Header => "header",
            SectionKind::Length => "length",
            SectionKind::Command => "command",
            SectionKind::Data => "data",
            SectionKind::Checksum => "checksum",
            SectionKind::Footer => "footer",
            SectionKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Wire size of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionSize {
    Fixed(usize),
    /// Resolved per packet (data sized by a length field or a message).
    Variable,
}

/// One field of the packet layout.
#[derive(Debug, Clone)]
pub enum Section {
    Header {
        pattern: Vec<u8>,
    },
    Length {
        width: usize,
        order: ByteOrder,
    },
    Command {
        size: usize,
        factory: Arc<dyn MessageFactory>,
    },
    /// `size` is only used when neither a length field nor a message
    /// decides the payload size.
    Data {
        size: usize,
    },
    Checksum {
        size: usize,
        covers: Vec<SectionKind>,
        validator: Arc<dyn ChecksumValidator>,
    },
    Footer {
        pattern: Vec<u8>,
    },
    /// Reserved; consumes nothing.
    Other,
}

impl Section {
    pub fn kind(&self) -> SectionKind {
        match self {
            Section::Header { .. } => SectionKind::Header,
            Section::Length { .. } => SectionKind::Length,
            Section::Command { .. } => SectionKind::Command,
            Section::Data { .. } => SectionKind::Data,
            Section::Checksum { .. } => SectionKind::Checksum,
            Section::Footer { .. } => SectionKind::Footer,
            Section::Other => SectionKind::Other,
        }
    }

    pub fn size(&self) -> SectionSize {
        match self {
            Section::Header { pattern } | Section::Footer { pattern } => {
                SectionSize::Fixed(pattern.len())
            }
            Section::Length { width, .. } => SectionSize::Fixed(*width),
            Section::Command { size, .. } => SectionSize::Fixed(*size),
            Section::Data { .. } => SectionSize::Variable,
            Section::Checksum { size, .. } => SectionSize::Fixed(*size),
            Section::Other => SectionSize::Fixed(0),
        }
    }
}

/// Reasons a layout is rejected, or a packet cannot be built from it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("layout has no sections")]
    Empty,

    #[error("layout has no header section")]
    MissingHeader,

    #[error("header section must be the first section")]
    HeaderNotFirst,

    #[error("{0} pattern must not be empty")]
    EmptyPattern(SectionKind),

    #[error("duplicate {0} section")]
    Duplicate(SectionKind),

    #[error("unsupported length width {0} (expected 1, 2 or 4)")]
    UnsupportedLengthWidth(usize),

    #[error("{0} section size must be non-zero")]
    ZeroSize(SectionKind),

    #[error("checksum cannot cover the {0} section")]
    InvalidCoverage(SectionKind),

    #[error("checksum covers {0} but the layout has no such section")]
    CoverageMissing(SectionKind),

    #[error("checksum must come after the {0} section it covers")]
    ChecksumBeforeCovered(SectionKind),

    #[error("checksum size {declared} does not match algorithm width {expected}")]
    ChecksumWidth { declared: usize, expected: usize },

    #[error("data section must come after the {0} section that sizes it")]
    DataBeforeDependency(SectionKind),

    #[error("command is {actual} bytes, layout expects {expected}")]
    CommandSize { expected: usize, actual: usize },

    #[error("payload of {len} bytes does not fit a {width}-byte length field")]
    LengthOverflow { len: usize, width: usize },

    #[error("checksum validator cannot compute a checksum")]
    ChecksumNotComputable,
}

/// Validated, immutable packet schema.
#[derive(Debug, Clone)]
pub struct PacketLayout {
    sections: Arc<[Section]>,
}

impl PacketLayout {
    /// Validate `sections` and build a layout from them.
    pub fn new(sections: Vec<Section>) -> Result<Self, LayoutError> {
        match sections.first() {
            None => return Err(LayoutError::Empty),
            Some(Section::Header { .. }) => {}
            Some(_) => {
                return Err(if sections.iter().any(|s| s.kind() == SectionKind::Header) {
                    LayoutError::HeaderNotFirst
                } else {
                    LayoutError::MissingHeader
                });
            }
        }

        let position = |kind: SectionKind| sections.iter().position(|s| s.kind() == kind);
        let mut seen: Vec<SectionKind> = Vec::with_capacity(sections.len());

        for section in &sections {
            let kind = section.kind();
            if kind != SectionKind::Other && seen.contains(&kind) {
                return Err(if kind == SectionKind::Header {
                    LayoutError::HeaderNotFirst
                } else {
                    LayoutError::Duplicate(kind)
                });
            }

            match section {
                Section::Header { pattern } | Section::Footer { pattern } => {
                    if pattern.is_empty() {
                        return Err(LayoutError::EmptyPattern(kind));
                    }
                }
                Section::Length { width, .. } => {
                    if !matches!(width, 1 | 2 | 4) {
                        return Err(LayoutError::UnsupportedLengthWidth(*width));
                    }
                }
                Section::Command { size, .. } => {
                    if *size == 0 {
                        return Err(LayoutError::ZeroSize(kind));
                    }
                }
                Section::Data { .. } => {
                    if position(SectionKind::Length).is_some() {
                        if !seen.contains(&SectionKind::Length) {
                            return Err(LayoutError::DataBeforeDependency(SectionKind::Length));
                        }
                    } else if position(SectionKind::Command).is_some()
                        && !seen.contains(&SectionKind::Command)
                    {
                        return Err(LayoutError::DataBeforeDependency(SectionKind::Command));
                    }
                }
                Section::Checksum {
                    size,
                    covers,
                    validator,
                } => {
                    if *size == 0 {
                        return Err(LayoutError::ZeroSize(kind));
                    }
                    for &covered in covers {
                        if !matches!(
                            covered,
                            SectionKind::Header
                                | SectionKind::Length
                                | SectionKind::Command
                                | SectionKind::Data
                        ) {
                            return Err(LayoutError::InvalidCoverage(covered));
                        }
                        if position(covered).is_none() {
                            return Err(LayoutError::CoverageMissing(covered));
                        }
                        if !seen.contains(&covered) {
                            return Err(LayoutError::ChecksumBeforeCovered(covered));
                        }
                    }
                    if let Some(expected) = validator.width() {
                        if expected != *size {
                            return Err(LayoutError::ChecksumWidth {
                                declared: *size,
                                expected,
                            });
                        }
                    }
                }
                Section::Other => {}
            }
            seen.push(kind);
        }

        Ok(Self {
            sections: sections.into(),
        })
    }

    /// Sections in wire order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, kind: SectionKind) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind() == kind)
    }

    pub fn header_pattern(&self) -> &[u8] {
        match self.sections.first() {
            Some(Section::Header { pattern }) => pattern,
            _ => &[],
        }
    }

    pub fn has_length(&self) -> bool {
        self.section(SectionKind::Length).is_some()
    }

    /// Serialise one well-formed packet carrying `command` and `data`.
    ///
    /// The length field (if any) is set to `data.len()` and the checksum
    /// (if any) is computed over the covered sections.
    pub fn build_packet(&self, command: &[u8], data: &[u8]) -> Result<Vec<u8>, LayoutError> {
        let mut out = Vec::with_capacity(data.len() + 16);
        let mut parts: Vec<(SectionKind, Vec<u8>)> = Vec::with_capacity(self.sections.len());

        for section in self.sections.iter() {
            let bytes = match section {
                Section::Header { pattern } | Section::Footer { pattern } => pattern.clone(),
                Section::Length { width, order } => {
                    encode_length(data.len(), *width, *order).ok_or(LayoutError::LengthOverflow {
                        len: data.len(),
                        width: *width,
                    })?
                }
                Section::Command { size, .. } => {
                    if command.len() != *size {
                        return Err(LayoutError::CommandSize {
                            expected: *size,
                            actual: command.len(),
                        });
                    }
                    command.to_vec()
                }
                Section::Data { .. } => data.to_vec(),
                Section::Checksum {
                    covers, validator, ..
                } => {
                    let covered = CoveredBytes::from_parts(
                        parts
                            .iter()
                            .filter(|(kind, _)| covers.contains(kind))
                            .map(|(kind, bytes)| (*kind, bytes.as_slice())),
                    );
                    validator
                        .compute(&covered)
                        .ok_or(LayoutError::ChecksumNotComputable)?
                }
                Section::Other => Vec::new(),
            };
            out.extend_from_slice(&bytes);
            parts.push((section.kind(), bytes));
        }

        Ok(out)
    }
}

/// Decode an unsigned length field of 1, 2 or 4 bytes.
///
/// Returns `None` for any other width.
pub fn decode_length(bytes: &[u8], order: ByteOrder) -> Option<u32> {
    match (bytes, order) {
        ([b], _) => Some(u32::from(*b)),
        ([a, b], ByteOrder::Msb) => Some(u32::from(u16::from_be_bytes([*a, *b]))),
        ([a, b], ByteOrder::Lsb) => Some(u32::from(u16::from_le_bytes([*a, *b]))),
        ([a, b, c, d], ByteOrder::Msb) => Some(u32::from_be_bytes([*a, *b, *c, *d])),
        ([a, b, c, d], ByteOrder::Lsb) => Some(u32::from_le_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}

/// Encode `value` into a `width`-byte length field, if it fits.
pub fn encode_length(value: usize, width: usize, order: ByteOrder) -> Option<Vec<u8>> {
    let bytes = match width {
        1 => vec![u8::try_from(value).ok()?],
        2 => {
            let v = u16::try_from(value).ok()?;
            match order {
                ByteOrder::Msb => v.to_be_bytes().to_vec(),
                ByteOrder::Lsb => v.to_le_bytes().to_vec(),
            }
        }
        4 => {
            let v = u32::try_from(value).ok()?;
            match order {
                ByteOrder::Msb => v.to_be_bytes().to_vec(),
                ByteOrder::Lsb => v.to_le_bytes().to_vec(),
            }
        }
        _ => return None,
    };
    Some(bytes)
}
