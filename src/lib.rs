//! Packet extractor
//!
//! Reassembles an untrusted byte stream into validated packets described by
//! a section-based layout (header, length, command, data, checksum, footer),
//! resynchronising on the header after corruption.

// ============================================
// Core Modules
// ============================================

/// Thread-safe bounded ring buffer shared by producers and consumers
pub mod buffer;
/// Framing worker and the feed / next_packet facade
pub mod extractor;
/// Packet layouts, checksums and command messages
pub mod packet;

// ============================================
// Configuration
// ============================================

/// YAML configuration for layouts and queue sizes
pub mod config;

pub use buffer::{BoundedQueue, QueueError, Wait};
pub use extractor::{
    ExtractorError, ExtractorOptions, Feeder, FoundPacket, FrameExtractor, PacketErrorKind,
    PacketPayload, PacketReceiver, ParsedPacket,
};
pub use packet::{ByteOrder, LayoutError, PacketLayout, Section, SectionKind};
