//! Stream-to-packet extraction
//!
//! `FrameExtractor` owns the two queues and the framing worker thread:
//!
//! ```text
//! producers ──feed()──▶ [ingress: BoundedQueue<u8>] ──▶ framing worker
//!                                                             │
//! consumers ◀─next_packet()── [egress: BoundedQueue<FoundPacket>] ◀┘
//! ```
//!
//! Backpressure flows end to end: a slow consumer fills the egress queue,
//! which stalls the worker, which lets the ingress queue fill and stalls
//! producers. The two queues are locked independently and no operation
//! holds both locks.

mod found;
mod framer;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::buffer::{BoundedQueue, QueueError, Wait};
use crate::packet::{LayoutError, PacketLayout};

pub use found::{FoundPacket, PacketErrorKind, PacketPayload, ParsedPacket};
pub use framer::REJECT_FLUSH_FACTOR;

use framer::Framer;

/// Default ingress queue size in bytes
pub const DEFAULT_INGRESS_CAPACITY: usize = 4096;

/// Default egress queue size in packets
pub const DEFAULT_EGRESS_CAPACITY: usize = 64;

/// Default upper bound for a decoded length field
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractorOptions {
    pub ingress_capacity: usize,
    pub egress_capacity: usize,
    /// Decoded lengths above this mark the pass `LengthInvalid`.
    pub max_payload_size: usize,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
            egress_capacity: DEFAULT_EGRESS_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Errors starting an extractor
#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    #[error("invalid layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("queue setup failed: {0}")]
    Queue(#[from] QueueError),

    #[error("failed to spawn framing worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Producer-side handle onto the ingress queue.
#[derive(Debug, Clone)]
pub struct Feeder {
    ingress: Arc<BoundedQueue<u8>>,
}

impl Feeder {
    /// Queue raw bytes, blocking while the ingress queue is full.
    pub fn feed(&self, bytes: &[u8]) -> Result<(), QueueError> {
        self.feed_with(bytes, Wait::Block)
    }

    /// Queue raw bytes under the given wait policy.
    ///
    /// Input longer than the ingress capacity is queued as consecutive
    /// runs, each waiting under `wait` on its own. On error, earlier runs
    /// stay queued.
    pub fn feed_with(&self, bytes: &[u8], wait: Wait) -> Result<(), QueueError> {
        for run in bytes.chunks(self.ingress.capacity()) {
            self.ingress.push_all(run.iter().copied(), wait)?;
        }
        Ok(())
    }

    /// Signal end of input.
    pub fn close(&self) {
        self.ingress.close();
    }
}

/// Consumer-side handle onto the egress queue.
///
/// Iterating yields packets until the worker has stopped and every
/// record has been drained.
#[derive(Debug, Clone)]
pub struct PacketReceiver {
    egress: Arc<BoundedQueue<FoundPacket>>,
}

impl PacketReceiver {
    pub fn next_packet(&self) -> Result<FoundPacket, QueueError> {
        self.egress.pop(Wait::Block)
    }

    pub fn next_packet_with(&self, wait: Wait) -> Result<FoundPacket, QueueError> {
        self.egress.pop(wait)
    }
}

impl Iterator for PacketReceiver {
    type Item = FoundPacket;

    fn next(&mut self) -> Option<FoundPacket> {
        self.next_packet().ok()
    }
}

/// Ingress queue, framing worker and egress queue for one byte stream.
#[derive(Debug)]
pub struct FrameExtractor {
    layout: Arc<PacketLayout>,
    ingress: Arc<BoundedQueue<u8>>,
    egress: Arc<BoundedQueue<FoundPacket>>,
    worker: Option<JoinHandle<()>>,
}

impl FrameExtractor {
    /// Create both queues and spawn the framing worker.
    pub fn start(layout: PacketLayout, options: ExtractorOptions) -> Result<Self, ExtractorError> {
        let layout = Arc::new(layout);
        let ingress = Arc::new(BoundedQueue::new(options.ingress_capacity)?);
        let egress = Arc::new(BoundedQueue::new(options.egress_capacity)?);

        let framer = Framer::new(
            Arc::clone(&layout),
            Arc::clone(&ingress),
            Arc::clone(&egress),
            options.max_payload_size,
        );
        let worker = thread::Builder::new()
            .name("frame-extractor".to_string())
            .spawn(move || framer.run())?;

        Ok(Self {
            layout,
            ingress,
            egress,
            worker: Some(worker),
        })
    }

    pub fn feed(&self, bytes: &[u8]) -> Result<(), QueueError> {
        self.feeder().feed(bytes)
    }

    pub fn feed_with(&self, bytes: &[u8], wait: Wait) -> Result<(), QueueError> {
        self.feeder().feed_with(bytes, wait)
    }

    /// Block until the worker emits a record.
    ///
    /// Fails with `Closed` once the worker has stopped and the egress
    /// queue is drained.
    pub fn next_packet(&self) -> Result<FoundPacket, QueueError> {
        self.egress.pop(Wait::Block)
    }

    pub fn next_packet_with(&self, wait: Wait) -> Result<FoundPacket, QueueError> {
        self.egress.pop(wait)
    }

    pub fn current_layout(&self) -> &PacketLayout {
        &self.layout
    }

    pub fn feeder(&self) -> Feeder {
        Feeder {
            ingress: Arc::clone(&self.ingress),
        }
    }

    pub fn receiver(&self) -> PacketReceiver {
        PacketReceiver {
            egress: Arc::clone(&self.egress),
        }
    }

    /// Signal end of input.
    ///
    /// The worker finishes every pass the buffered bytes complete, flushes
    /// pending rejected bytes, then closes the egress queue.
    pub fn close_input(&self) {
        self.ingress.close();
    }

    /// Stop the worker now and wait for it to exit.
    ///
    /// Records still queued for consumers are discarded.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.ingress.close();
        self.egress.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("[extractor] framing worker panicked");
            }
        }
    }
}

impl Drop for FrameExtractor {
    fn drop(&mut self) {
        self.stop();
    }
}
