//! Buffered pipeline between the network session and audio output
//!
//! Chunk payloads go into a single-producer single-consumer byte ring; their
//! headers go into a parallel bounded queue in the same order. The consumer
//! pops one header, then reads exactly `size` bytes, so the byte stream needs
//! no delimiters.
//!
//! The writer always commits the bytes before sending the header. A header
//! visible to the consumer therefore always has its bytes in the ring.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use rtrb::{Consumer, Producer, RingBuffer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::config::BufferConfig;
use crate::error::PipelineError;
use crate::protocol::{StreamSpec, TimeVal};

/// Metadata travelling alongside each chunk's bytes
#[derive(Debug, Clone, PartialEq)]
pub struct AudioHeader {
    pub sec: i32,
    pub usec: i32,
    pub size: u32,
    /// Stream the chunk belongs to, fixed when it entered the pipeline
    pub stream: Arc<StreamSpec>,
}

impl AudioHeader {
    pub fn new(timestamp: TimeVal, size: u32, stream: Arc<StreamSpec>) -> Self {
        Self {
            sec: timestamp.sec,
            usec: timestamp.usec,
            size,
            stream,
        }
    }

    pub fn timestamp(&self) -> TimeVal {
        TimeVal::new(self.sec, self.usec)
    }
}

/// Sizing and timing of a pipeline
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Byte capacity of the ring
    pub capacity: usize,
    /// Fill level at which the reader starts draining
    pub activation_bytes: usize,
    pub max_chunks: usize,
    /// Longest `push` waits for space
    pub write_wait: Duration,
}

impl From<&BufferConfig> for PipelineOptions {
    fn from(config: &BufferConfig) -> Self {
        Self {
            capacity: config.capacity(),
            activation_bytes: config.activation_bytes(),
            max_chunks: config.max_queued_chunks,
            write_wait: config.write_wait(),
        }
    }
}

#[derive(Default)]
struct Counters {
    chunks_pushed: AtomicU64,
    bytes_pushed: AtomicU64,
    chunks_popped: AtomicU64,
    bytes_popped: AtomicU64,
    full_timeouts: AtomicU64,
}

struct Shared {
    capacity: usize,
    /// Signalled by the reader whenever it frees space
    space: Notify,
    active: AtomicBool,
    /// Set when a push was refused for lack of space before activation
    writer_blocked: AtomicBool,
    counters: Counters,
}

/// Pipeline statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub chunks_pushed: u64,
    pub bytes_pushed: u64,
    pub chunks_popped: u64,
    pub bytes_popped: u64,
    pub full_timeouts: u64,
    pub active: bool,
}

impl Shared {
    fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            chunks_pushed: c.chunks_pushed.load(Ordering::Relaxed),
            bytes_pushed: c.bytes_pushed.load(Ordering::Relaxed),
            chunks_popped: c.chunks_popped.load(Ordering::Relaxed),
            bytes_popped: c.bytes_popped.load(Ordering::Relaxed),
            full_timeouts: c.full_timeouts.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

/// Create a connected writer/reader pair
pub fn pipeline(options: PipelineOptions) -> (PipelineWriter, PipelineReader) {
    let (producer, consumer) = RingBuffer::<u8>::new(options.capacity);
    let (header_tx, header_rx) = crossbeam_channel::bounded(options.max_chunks);
    let shared = Arc::new(Shared {
        capacity: options.capacity,
        space: Notify::new(),
        active: AtomicBool::new(false),
        writer_blocked: AtomicBool::new(false),
        counters: Counters::default(),
    });

    let writer = PipelineWriter {
        bytes: producer,
        headers: header_tx,
        shared: shared.clone(),
        write_wait: options.write_wait,
    };
    let reader = PipelineReader {
        bytes: consumer,
        headers: header_rx,
        shared,
        activation_bytes: options.activation_bytes.min(options.capacity),
    };
    (writer, reader)
}

/// Producer half, held by the session
pub struct PipelineWriter {
    bytes: Producer<u8>,
    headers: Sender<AudioHeader>,
    shared: Arc<Shared>,
    write_wait: Duration,
}

impl PipelineWriter {
    /// Append a chunk, waiting up to the configured write wait for space
    pub async fn push(&mut self, header: &AudioHeader, payload: &[u8]) -> Result<(), PipelineError> {
        let deadline = tokio::time::Instant::now() + self.write_wait;
        loop {
            match self.try_push(header, payload) {
                Err(PipelineError::Full) => {}
                other => return other,
            }
            let shared = self.shared.clone();
            if tokio::time::timeout_at(deadline, shared.space.notified())
                .await
                .is_err()
            {
                self.shared
                    .counters
                    .full_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                return Err(PipelineError::Full);
            }
        }
    }

    /// Append a chunk if there is room right now
    pub fn try_push(&mut self, header: &AudioHeader, payload: &[u8]) -> Result<(), PipelineError> {
        let size = payload.len();
        if size > self.shared.capacity {
            return Err(PipelineError::ChunkTooLarge {
                size,
                capacity: self.shared.capacity,
            });
        }
        if self.bytes.is_abandoned() {
            return Err(PipelineError::Closed);
        }
        if self.bytes.slots() < size || self.headers.is_full() {
            // the threshold may be unreachable with this chunk size
            self.shared.writer_blocked.store(true, Ordering::Relaxed);
            return Err(PipelineError::Full);
        }

        let mut chunk = self
            .bytes
            .write_chunk(size)
            .map_err(|_| PipelineError::Full)?;
        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&payload[..split]);
        second.copy_from_slice(&payload[split..]);
        chunk.commit_all();

        let header = AudioHeader {
            size: size as u32,
            ..header.clone()
        };
        self.headers
            .try_send(header)
            .map_err(|_| PipelineError::Closed)?;

        let counters = &self.shared.counters;
        counters.chunks_pushed.fetch_add(1, Ordering::Relaxed);
        counters.bytes_pushed.fetch_add(size as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Free bytes in the ring
    pub fn free(&self) -> usize {
        self.bytes.slots()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }
}

/// Consumer half, held by the output driver
pub struct PipelineReader {
    bytes: Consumer<u8>,
    headers: Receiver<AudioHeader>,
    shared: Arc<Shared>,
    activation_bytes: usize,
}

impl PipelineReader {
    /// Bytes currently buffered
    pub fn fill(&self) -> usize {
        self.bytes.slots()
    }

    /// Queued chunk headers
    pub fn queued(&self) -> usize {
        self.headers.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Writer gone and nothing left to drain
    pub fn is_closed(&self) -> bool {
        self.bytes.is_abandoned() && self.headers.is_empty()
    }

    /// Latch the active state once the fill level reaches the threshold or
    /// the writer cannot add more
    pub fn poll_activation(&self) -> bool {
        if self.is_active() {
            return true;
        }
        let fill = self.fill();
        let blocked = self.shared.writer_blocked.load(Ordering::Relaxed);
        if fill >= self.activation_bytes || self.headers.is_full() || blocked {
            self.shared.active.store(true, Ordering::Relaxed);
            tracing::info!(
                "Pipeline active at {} of {} bytes ({} chunks)",
                fill,
                self.shared.capacity,
                self.queued()
            );
            return true;
        }
        false
    }

    /// Pop the next chunk into `buf`, waiting up to `timeout` for one.
    ///
    /// Returns `Ok(None)` while the pipeline is still filling up or when
    /// nothing arrived in time.
    pub fn pop_timeout(
        &mut self,
        buf: &mut Vec<u8>,
        timeout: Duration,
    ) -> Result<Option<AudioHeader>, PipelineError> {
        if !self.poll_activation() {
            if self.is_closed() {
                return Err(PipelineError::Closed);
            }
            return Ok(None);
        }
        match self.headers.recv_timeout(timeout) {
            Ok(header) => self.read_payload(header, buf).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Closed),
        }
    }

    /// Pop the next chunk without blocking
    pub fn try_pop(&mut self, buf: &mut Vec<u8>) -> Result<Option<AudioHeader>, PipelineError> {
        if !self.poll_activation() {
            if self.is_closed() {
                return Err(PipelineError::Closed);
            }
            return Ok(None);
        }
        match self.headers.try_recv() {
            Ok(header) => self.read_payload(header, buf).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(PipelineError::Closed),
        }
    }

    fn read_payload(
        &mut self,
        header: AudioHeader,
        buf: &mut Vec<u8>,
    ) -> Result<AudioHeader, PipelineError> {
        let size = header.size as usize;
        buf.clear();
        let chunk = self
            .bytes
            .read_chunk(size)
            .map_err(|_| PipelineError::Closed)?;
        let (first, second) = chunk.as_slices();
        buf.extend_from_slice(first);
        buf.extend_from_slice(second);
        chunk.commit_all();
        self.shared.space.notify_one();

        let counters = &self.shared.counters;
        counters.chunks_popped.fetch_add(1, Ordering::Relaxed);
        counters.bytes_popped.fetch_add(size as u64, Ordering::Relaxed);
        Ok(header)
    }

    /// Drop every queued chunk and wait for the threshold again.
    ///
    /// Only bytes that belong to a dequeued header are discarded, so a chunk
    /// the writer is committing concurrently stays consistent.
    pub fn clear(&mut self) {
        let mut dropped = 0usize;
        let mut chunks = 0usize;
        while let Ok(header) = self.headers.try_recv() {
            dropped += header.size as usize;
            chunks += 1;
        }
        let available = self.bytes.slots();
        if let Ok(chunk) = self.bytes.read_chunk(dropped.min(available)) {
            chunk.commit_all();
        }
        self.shared.active.store(false, Ordering::Relaxed);
        self.shared.writer_blocked.store(false, Ordering::Relaxed);
        self.shared.space.notify_one();
        tracing::debug!("Pipeline cleared: {} chunks, {} bytes", chunks, dropped);
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }
}
