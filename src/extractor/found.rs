//! Extraction results handed to consumers.

use std::fmt;

use bytes::Bytes;

use crate::packet::Message;

/// Outcome classification of one extraction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketErrorKind {
    #[default]
    None,
    /// Bytes skipped while searching for the header.
    HeaderMismatch,
    /// Length field could not be decoded or exceeds the payload limit.
    LengthInvalid,
    ChecksumMismatch,
    FooterMismatch,
    /// No message type matched the command code.
    UnhandledSection,
}

impl fmt::Display for PacketErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketErrorKind::None => "ok",
            PacketErrorKind::HeaderMismatch => "header_mismatch",
            PacketErrorKind::LengthInvalid => "length_invalid",
            PacketErrorKind::ChecksumMismatch => "checksum_mismatch",
            PacketErrorKind::FooterMismatch => "footer_mismatch",
            PacketErrorKind::UnhandledSection => "unhandled_section",
        };
        f.write_str(name)
    }
}

/// Every section read during a pass. Absent sections stay empty.
#[derive(Debug, Default)]
pub struct ParsedPacket {
    pub header: Bytes,
    pub length_field: Bytes,
    /// Decoded length field, even when it was rejected.
    pub length: Option<u32>,
    pub command: Bytes,
    pub message: Option<Box<dyn Message>>,
    pub data: Bytes,
    pub checksum: Bytes,
    pub footer: Bytes,
}

#[derive(Debug)]
pub enum PacketPayload {
    Parsed(ParsedPacket),
    /// Bytes discarded while resynchronising on the header.
    Rejected(Bytes),
}

/// One record from the egress queue.
#[derive(Debug)]
pub struct FoundPacket {
    pub error: PacketErrorKind,
    pub payload: PacketPayload,
}

impl FoundPacket {
    pub fn rejected(bytes: Bytes) -> Self {
        Self {
            error: PacketErrorKind::HeaderMismatch,
            payload: PacketPayload::Rejected(bytes),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error == PacketErrorKind::None
    }

    pub fn parsed(&self) -> Option<&ParsedPacket> {
        match &self.payload {
            PacketPayload::Parsed(p) => Some(p),
            PacketPayload::Rejected(_) => None,
        }
    }

    pub fn rejected_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            PacketPayload::Rejected(b) => Some(b),
            PacketPayload::Parsed(_) => None,
        }
    }

    pub fn command(&self) -> Option<&[u8]> {
        self.parsed().map(|p| &p.command[..])
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.parsed().map(|p| &p.data[..])
    }

    pub fn message(&self) -> Option<&dyn Message> {
        self.parsed().and_then(|p| p.message.as_deref())
    }
}

impl fmt::Display for FoundPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            PacketPayload::Rejected(bytes) => {
                write!(f, "{} rejected={} ({} bytes)", self.error, hex::encode(bytes), bytes.len())
            }
            PacketPayload::Parsed(p) => {
                write!(f, "{} cmd={}", self.error, hex::encode(&p.command))?;
                if let Some(msg) = &p.message {
                    write!(f, " msg={}", msg.name())?;
                }
                if let Some(len) = p.length {
                    write!(f, " len={len}")?;
                }
                write!(f, " data={}", hex::encode(&p.data))
            }
        }
    }
}
