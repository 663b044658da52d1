//! The framing worker
//!
//! A single `Framer` owns the ingress read cursor. Each pass walks the
//! layout once, calling the handler for every section in order, and pushes
//! exactly one `FoundPacket` for the pass. Header matching is the only
//! resync mechanism: it reads byte by byte until the full pattern shows up,
//! and the bytes it skips are surfaced as `HeaderMismatch` records. A pass
//! cut short by end of input is surfaced the same way.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use super::found::{FoundPacket, PacketErrorKind, PacketPayload, ParsedPacket};
use crate::buffer::{BoundedQueue, QueueError, Wait};
use crate::packet::{
    decode_length, ByteOrder, ChecksumValidator, CoveredBytes, Message, MessageFactory,
    PacketLayout, Section, SectionKind,
};

/// Rejected bytes are flushed once they reach this many header lengths.
pub const REJECT_FLUSH_FACTOR: usize = 5;

/// Working record for the packet being assembled.
#[derive(Debug, Default)]
pub(crate) struct ExtractionState {
    header: Bytes,
    length_field: Bytes,
    length: Option<u32>,
    length_ok: bool,
    command: Bytes,
    message: Option<Box<dyn Message>>,
    data: Bytes,
    checksum: Bytes,
    footer: Bytes,
    error: PacketErrorKind,
}

impl ExtractionState {
    /// Keep the first error of the pass.
    fn record(&mut self, outcome: PacketErrorKind) {
        if self.error == PacketErrorKind::None {
            self.error = outcome;
        }
    }

    fn section_bytes(&self, kind: SectionKind) -> &[u8] {
        match kind {
            SectionKind::Header => &self.header[..],
            SectionKind::Length => &self.length_field[..],
            SectionKind::Command => &self.command[..],
            SectionKind::Data => &self.data[..],
            SectionKind::Checksum => &self.checksum[..],
            SectionKind::Footer => &self.footer[..],
            SectionKind::Other => &[],
        }
    }

    fn into_found(self) -> FoundPacket {
        FoundPacket {
            error: self.error,
            payload: PacketPayload::Parsed(ParsedPacket {
                header: self.header,
                length_field: self.length_field,
                length: self.length,
                command: self.command,
                message: self.message,
                data: self.data,
                checksum: self.checksum,
                footer: self.footer,
            }),
        }
    }
}

pub(crate) struct Framer {
    layout: Arc<PacketLayout>,
    ingress: Arc<BoundedQueue<u8>>,
    egress: Arc<BoundedQueue<FoundPacket>>,
    max_payload_size: usize,
    rejected: BytesMut,
    /// Bytes consumed by the current pass since its header matched.
    partial: BytesMut,
}

impl Framer {
    pub(crate) fn new(
        layout: Arc<PacketLayout>,
        ingress: Arc<BoundedQueue<u8>>,
        egress: Arc<BoundedQueue<FoundPacket>>,
        max_payload_size: usize,
    ) -> Self {
        let reject_cap = layout.header_pattern().len() * (REJECT_FLUSH_FACTOR + 1);
        Self {
            layout,
            ingress,
            egress,
            max_payload_size,
            rejected: BytesMut::with_capacity(reject_cap),
            partial: BytesMut::new(),
        }
    }

    /// Run passes until either queue is closed.
    pub(crate) fn run(mut self) {
        tracing::info!("[extractor] worker started sections={}", self.layout.sections().len());
        let mut passes: u64 = 0;

        loop {
            let found = match self.run_pass() {
                Ok(found) => found,
                Err(e) => {
                    tracing::debug!(
                        "[extractor] pass interrupted after {} bytes: {e}",
                        self.partial.len()
                    );
                    let partial = self.partial.split();
                    self.rejected.extend_from_slice(&partial);
                    break;
                }
            };
            if found.error != PacketErrorKind::None {
                tracing::warn!("[extractor] pass={passes} {found}");
            }
            passes += 1;
            if self.egress.push(found, Wait::Block).is_err() {
                break;
            }
        }

        if let Err(e) = self.flush_rejected() {
            tracing::debug!("[extractor] dropped rejected bytes on shutdown: {e}");
        }
        self.egress.close();
        tracing::info!("[extractor] worker stopped passes={passes}");
    }

    fn run_pass(&mut self) -> Result<FoundPacket, QueueError> {
        let layout = Arc::clone(&self.layout);
        let mut state = ExtractionState::default();
        self.partial.clear();

        for section in layout.sections() {
            let outcome = match section {
                Section::Header { pattern } => self.handle_header(pattern, &mut state)?,
                Section::Length { width, order } => {
                    let field = self.read_bytes(*width)?;
                    self.handle_length(field, *order, &mut state)
                }
                Section::Command { size, factory } => {
                    self.handle_command(*size, factory.as_ref(), &mut state)?
                }
                Section::Data { size } => self.handle_data(*size, &mut state)?,
                Section::Checksum {
                    size,
                    covers,
                    validator,
                } => self.handle_checksum(*size, covers, validator.as_ref(), &mut state)?,
                Section::Footer { pattern } => {
                    state.footer = self.read_bytes(pattern.len())?;
                    if state.footer[..] == pattern[..] {
                        PacketErrorKind::None
                    } else {
                        PacketErrorKind::FooterMismatch
                    }
                }
                Section::Other => PacketErrorKind::None,
            };
            state.record(outcome);
        }

        Ok(state.into_found())
    }

    /// Slide over the stream until `pattern` matches.
    ///
    /// A mismatch restarts the match from scratch; the mismatching byte and
    /// any partial match before it go to the rejected buffer.
    fn handle_header(
        &mut self,
        pattern: &[u8],
        state: &mut ExtractionState,
    ) -> Result<PacketErrorKind, QueueError> {
        let threshold = pattern.len() * REJECT_FLUSH_FACTOR;
        let mut matched = 0;

        while matched < pattern.len() {
            let byte = match self.ingress.pop(Wait::Block) {
                Ok(b) => b,
                Err(e) => {
                    self.rejected.extend_from_slice(&pattern[..matched]);
                    return Err(e);
                }
            };
            if byte == pattern[matched] {
                matched += 1;
                continue;
            }
            self.rejected.extend_from_slice(&pattern[..matched]);
            self.rejected.put_u8(byte);
            matched = 0;
            if self.rejected.len() >= threshold {
                self.flush_rejected()?;
            }
        }

        self.flush_rejected()?;
        self.partial.extend_from_slice(pattern);
        state.header = Bytes::copy_from_slice(pattern);
        Ok(PacketErrorKind::None)
    }

    fn handle_length(
        &self,
        field: Bytes,
        order: ByteOrder,
        state: &mut ExtractionState,
    ) -> PacketErrorKind {
        let decoded = decode_length(&field, order);
        state.length_field = field;
        state.length = decoded;
        match decoded {
            Some(len) if len as usize <= self.max_payload_size => {
                state.length_ok = true;
                PacketErrorKind::None
            }
            Some(len) => {
                tracing::debug!(
                    "[extractor] length {len} exceeds max_payload_size={}",
                    self.max_payload_size
                );
                PacketErrorKind::LengthInvalid
            }
            None => PacketErrorKind::LengthInvalid,
        }
    }

    fn handle_command(
        &mut self,
        size: usize,
        factory: &dyn MessageFactory,
        state: &mut ExtractionState,
    ) -> Result<PacketErrorKind, QueueError> {
        state.command = self.read_bytes(size)?;
        state.message = factory.build_message(&state.command);
        if state.message.is_some() {
            Ok(PacketErrorKind::None)
        } else {
            tracing::debug!("[extractor] no message for cmd={}", hex::encode(&state.command));
            Ok(PacketErrorKind::UnhandledSection)
        }
    }

    /// Payload size: length field, else the message's size, else the static size.
    fn handle_data(
        &mut self,
        static_size: usize,
        state: &mut ExtractionState,
    ) -> Result<PacketErrorKind, QueueError> {
        let size = if self.layout.has_length() {
            match state.length {
                Some(len) if state.length_ok => len as usize,
                _ => 0,
            }
        } else if let Some(msg) = &state.message {
            msg.serialized_size()
        } else {
            static_size
        };
        state.data = self.read_bytes(size)?;
        Ok(PacketErrorKind::None)
    }

    fn handle_checksum(
        &mut self,
        size: usize,
        covers: &[SectionKind],
        validator: &dyn ChecksumValidator,
        state: &mut ExtractionState,
    ) -> Result<PacketErrorKind, QueueError> {
        state.checksum = self.read_bytes(size)?;
        let covered = CoveredBytes::from_parts(
            self.layout
                .sections()
                .iter()
                .map(Section::kind)
                .filter(|kind| covers.contains(kind))
                .map(|kind| (kind, state.section_bytes(kind))),
        );
        if validator.validate(&covered, &state.checksum) {
            Ok(PacketErrorKind::None)
        } else {
            Ok(PacketErrorKind::ChecksumMismatch)
        }
    }

    /// Read exactly `count` bytes, however many ingress pops that takes.
    fn read_bytes(&mut self, count: usize) -> Result<Bytes, QueueError> {
        let mut out = BytesMut::with_capacity(count);
        while out.len() < count {
            let run = self.ingress.pop_up_to(count - out.len(), Wait::Block)?;
            self.partial.extend_from_slice(&run);
            out.extend_from_slice(&run);
        }
        Ok(out.freeze())
    }

    fn flush_rejected(&mut self) -> Result<(), QueueError> {
        if self.rejected.is_empty() {
            return Ok(());
        }
        let bytes = self.rejected.split().freeze();
        tracing::debug!("[extractor] flushing {} rejected bytes", bytes.len());
        self.egress.push(FoundPacket::rejected(bytes), Wait::Block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{BuiltinChecksum, ChecksumAlgorithm, CommandTable};

    fn framer(
        sections: Vec<Section>,
        input: &[u8],
        max_payload_size: usize,
    ) -> (Framer, Arc<BoundedQueue<FoundPacket>>) {
        let layout = Arc::new(PacketLayout::new(sections).unwrap());
        let ingress = Arc::new(BoundedQueue::new(input.len().max(1)).unwrap());
        ingress.push_all(input.iter().copied(), Wait::Immediate).unwrap();
        ingress.close();
        let egress = Arc::new(BoundedQueue::new(64).unwrap());
        let framer = Framer::new(layout, ingress, Arc::clone(&egress), max_payload_size);
        (framer, egress)
    }

    /// Run the worker to completion and collect everything it emitted.
    fn extract(sections: Vec<Section>, input: &[u8]) -> Vec<FoundPacket> {
        let (framer, egress) = framer(sections, input, 65535);
        framer.run();
        std::iter::from_fn(|| egress.pop_try().ok()).collect()
    }

    fn ping_table() -> Arc<CommandTable> {
        let mut table = CommandTable::new();
        table.register([0x01], "ping", 3);
        Arc::new(table)
    }

    fn length_layout() -> Vec<Section> {
        vec![
            Section::Header { pattern: vec![0x7E] },
            Section::Length { width: 1, order: ByteOrder::Msb },
            Section::Command { size: 1, factory: ping_table() },
            Section::Data { size: 0 },
            Section::Footer { pattern: vec![0x7F] },
        ]
    }

    #[test]
    fn test_single_packet() {
        let found = extract(length_layout(), &[0x7E, 0x03, 0x01, 0xAA, 0xBB, 0xCC, 0x7F]);
        assert_eq!(found.len(), 1);
        let pkt = &found[0];
        assert!(pkt.is_ok());
        assert_eq!(pkt.command(), Some(&[0x01][..]));
        assert_eq!(pkt.data(), Some(&[0xAA, 0xBB, 0xCC][..]));
        assert_eq!(pkt.message().map(|m| m.name()), Some("ping"));
        let parsed = pkt.parsed().unwrap();
        assert_eq!(parsed.length, Some(3));
        assert_eq!(&parsed.header[..], &[0x7E]);
        assert_eq!(&parsed.footer[..], &[0x7F]);
    }

    #[test]
    fn test_header_resync_flushes_garbage() {
        let sections = vec![
            Section::Header { pattern: vec![0xAA, 0x55] },
            Section::Data { size: 2 },
        ];
        let mut input = vec![0x00; 20];
        input.extend_from_slice(&[0xAA, 0x55, 0x10, 0x20]);

        let found = extract(sections, &input);
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].error, PacketErrorKind::HeaderMismatch);
        assert_eq!(found[0].rejected_bytes().map(<[u8]>::len), Some(10));
        assert_eq!(found[1].error, PacketErrorKind::HeaderMismatch);
        assert_eq!(found[1].rejected_bytes().map(<[u8]>::len), Some(10));
        assert!(found[2].is_ok());
        assert_eq!(found[2].data(), Some(&[0x10, 0x20][..]));
    }

    #[test]
    fn test_short_garbage_flushed_when_header_found() {
        let sections = vec![
            Section::Header { pattern: vec![0xAA, 0x55] },
            Section::Data { size: 1 },
        ];
        let found = extract(sections, &[0x01, 0x02, 0x03, 0xAA, 0x55, 0x09]);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].rejected_bytes(), Some(&[0x01, 0x02, 0x03][..]));
        assert_eq!(found[1].data(), Some(&[0x09][..]));
    }

    #[test]
    fn test_partial_match_goes_to_rejected() {
        let sections = vec![
            Section::Header { pattern: vec![0xAA, 0x55] },
            Section::Data { size: 1 },
        ];
        // 0xAA 0x01 breaks the match; the restart does not reuse the failing byte
        let found = extract(sections, &[0xAA, 0x01, 0xAA, 0x55, 0x42]);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].rejected_bytes(), Some(&[0xAA, 0x01][..]));
        assert_eq!(found[1].data(), Some(&[0x42][..]));
    }

    #[test]
    fn test_restart_from_scratch_skips_overlapping_header() {
        let sections = vec![
            Section::Header { pattern: vec![0xAA, 0x55] },
            Section::Data { size: 1 },
        ];
        // second 0xAA fails to extend the match and is not retried as a start
        let found = extract(sections, &[0xAA, 0xAA, 0x55, 0xAA, 0x55, 0x01]);
        assert_eq!(found[0].rejected_bytes(), Some(&[0xAA, 0xAA, 0x55][..]));
        assert!(found[1].is_ok());
        assert_eq!(found[1].data(), Some(&[0x01][..]));
    }

    #[test]
    fn test_checksum_mismatch_keeps_data() {
        let sections = vec![
            Section::Header { pattern: vec![0x7E] },
            Section::Command { size: 1, factory: ping_table() },
            Section::Data { size: 0 },
            Section::Checksum {
                size: 1,
                covers: vec![SectionKind::Command, SectionKind::Data],
                validator: Arc::new(BuiltinChecksum::new(ChecksumAlgorithm::Xor8, ByteOrder::Msb)),
            },
        ];
        let good_xor = 0x01 ^ 0x0A ^ 0x0B ^ 0x0C;
        let input = [
            0x7E, 0x01, 0x0A, 0x0B, 0x0C, good_xor,
            0x7E, 0x01, 0x0A, 0x0B, 0x0C, good_xor ^ 0xFF,
        ];

        let found = extract(sections, &input);
        assert_eq!(found.len(), 2);
        assert!(found[0].is_ok());
        assert_eq!(found[1].error, PacketErrorKind::ChecksumMismatch);
        assert_eq!(found[1].data(), Some(&[0x0A, 0x0B, 0x0C][..]));
        assert_eq!(found[1].message().map(|m| m.name()), Some("ping"));
    }

    #[test]
    fn test_footer_mismatch() {
        let found = extract(length_layout(), &[0x7E, 0x01, 0x01, 0xAA, 0x00]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].error, PacketErrorKind::FooterMismatch);
        assert_eq!(found[0].data(), Some(&[0xAA][..]));
    }

    #[test]
    fn test_unknown_command_falls_back_to_static_size() {
        let sections = vec![
            Section::Header { pattern: vec![0x7E] },
            Section::Command { size: 1, factory: ping_table() },
            Section::Data { size: 2 },
        ];
        // 0x01 sizes data by its message (3), 0x02 falls back to 2
        let found = extract(sections, &[0x7E, 0x01, 1, 2, 3, 0x7E, 0x02, 4, 5]);
        assert_eq!(found.len(), 2);
        assert!(found[0].is_ok());
        assert_eq!(found[0].data(), Some(&[1, 2, 3][..]));
        assert_eq!(found[1].error, PacketErrorKind::UnhandledSection);
        assert!(found[1].message().is_none());
        assert_eq!(found[1].command(), Some(&[0x02][..]));
        assert_eq!(found[1].data(), Some(&[4, 5][..]));
    }

    #[test]
    fn test_oversized_length_is_invalid() {
        let (framer, egress) = framer(length_layout(), &[0x7E, 0x09, 0x01, 0x7F], 4);
        framer.run();
        let found = egress.pop_try().unwrap();
        assert_eq!(found.error, PacketErrorKind::LengthInvalid);
        assert_eq!(found.parsed().and_then(|p| p.length), Some(9));
        assert_eq!(found.data(), Some(&[][..]));
        assert!(egress.pop_try().is_err());
    }

    #[test]
    fn test_first_error_wins() {
        let sections = vec![
            Section::Header { pattern: vec![0x7E] },
            Section::Command { size: 1, factory: ping_table() },
            Section::Data { size: 1 },
            Section::Footer { pattern: vec![0x7F] },
        ];
        let found = extract(sections, &[0x7E, 0x05, 0x00, 0x00]);
        assert_eq!(found[0].error, PacketErrorKind::UnhandledSection);
    }

    #[test]
    fn test_trailing_garbage_flushed_on_close() {
        let sections = vec![
            Section::Header { pattern: vec![0xAA, 0x55] },
            Section::Data { size: 1 },
        ];
        let found = extract(sections, &[0xAA, 0x55, 0x01, 0x10, 0xAA]);
        assert_eq!(found.len(), 2);
        assert!(found[0].is_ok());
        assert_eq!(found[1].rejected_bytes(), Some(&[0x10, 0xAA][..]));
    }

    #[test]
    fn test_truncated_pass_flushed_as_rejected() {
        let found = extract(length_layout(), &[0x7E, 0x03, 0x01, 0xAA]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].error, PacketErrorKind::HeaderMismatch);
        assert_eq!(found[0].rejected_bytes(), Some(&[0x7E, 0x03, 0x01, 0xAA][..]));
    }

    #[test]
    fn test_truncation_after_complete_packet() {
        let found = extract(
            length_layout(),
            &[0x7E, 0x01, 0x01, 0xAA, 0x7F, 0x00, 0x7E, 0x02],
        );
        assert_eq!(found.len(), 3);
        assert!(found[0].is_ok());
        // garbage before the second header, then the unfinished pass
        assert_eq!(found[1].rejected_bytes(), Some(&[0x00][..]));
        assert_eq!(found[2].rejected_bytes(), Some(&[0x7E, 0x02][..]));
    }

    #[test]
    fn test_other_section_consumes_nothing() {
        let sections = vec![
            Section::Header { pattern: vec![0x7E] },
            Section::Other,
            Section::Data { size: 2 },
        ];
        let found = extract(sections, &[0x7E, 0x01, 0x02]);
        assert!(found[0].is_ok());
        assert_eq!(found[0].data(), Some(&[0x01, 0x02][..]));
    }
}
