//! Session engine: connection lifecycle, handshake and message dispatch
//!
//! The session owns the socket and the producer half of the pipeline. It
//! connects, announces itself with a Hello, then reads frames and applies
//! them: codec headers select the stream for subsequent chunks, chunks go into
//! the pipeline, settings go to volume and synchronizer, TIME replies feed the
//! clock model. Any transport error tears the connection down and the outer
//! loop reconnects after a fixed backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch};

use crate::audio::buffer::{AudioHeader, PipelineWriter};
use crate::audio::output::OutputDriver;
use crate::audio::volume::SharedVolume;
use crate::codec::SharedRegistry;
use crate::config::ClientConfig;
use crate::constants::TIME_PROBE_INTERVAL_MS;
use crate::error::{Error, NetworkError, PipelineError, Result};
use crate::network::connection::{Frame, FrameReader, FrameWriter};
use crate::protocol::{
    serialize, time_probe, BaseMessage, Hello, Message, MessageType, ServerSettings, StreamSpec,
    TimeMessage, WireChunk,
};
use crate::sync::{SharedClock, SharedClockModel, SharedTimeSync};

/// Frames read ahead of dispatch
const FRAME_QUEUE: usize = 8;

/// Cooperative mode: pause between attempts while the pipeline is full
const COOPERATIVE_RETRY: Duration = Duration::from_millis(1);

const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Connection lifecycle as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    HandshakeSent,
    Streaming,
}

/// Shared state the session updates and the output side reads
#[derive(Clone)]
pub struct SessionHandles {
    pub clock: SharedClock,
    pub clock_model: SharedClockModel,
    pub time_sync: SharedTimeSync,
    pub volume: SharedVolume,
    pub registry: SharedRegistry,
}

/// Session statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connections: u64,
    pub messages: u64,
    pub chunks_queued: u64,
    /// Chunks without a usable stream or rejected by a full pipeline
    pub chunks_dropped: u64,
    pub malformed: u64,
    pub probes_sent: u64,
}

pub struct SnapSession {
    config: ClientConfig,
    handles: SessionHandles,
    writer: PipelineWriter,
    /// Present in cooperative mode only
    driver: Option<OutputDriver>,
    state: watch::Sender<SessionState>,
    /// Stream for subsequent chunks; `None` refuses audio
    stream: Option<Arc<StreamSpec>>,
    next_id: u16,
    last_probe_ms: Option<u64>,
    /// Server settings applied so far
    settings: ServerSettings,
    stats: SessionStats,
    last_stats: Instant,
}

impl SnapSession {
    pub fn new(
        config: ClientConfig,
        handles: SessionHandles,
        writer: PipelineWriter,
        driver: Option<OutputDriver>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            handles,
            writer,
            driver,
            state,
            stream: None,
            next_id: 0,
            last_probe_ms: None,
            settings: ServerSettings::default(),
            stats: SessionStats::default(),
            last_stats: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// The cooperative output driver, if any
    pub fn take_driver(&mut self) -> Option<OutputDriver> {
        self.driver.take()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Session {:?} -> {:?}", previous, state);
        }
    }

    /// Connect, stream, reconnect until `shutdown` turns true.
    ///
    /// Transport failures are retried forever. Only configuration-class errors
    /// return early.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let address = self.config.server.address();
        let connect_timeout = self.config.server.connect_timeout();
        let backoff = self.config.server.reconnect_backoff();

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(SessionState::Connecting);
            tracing::info!("Connecting to {}", address);

            let connect = tokio::time::timeout(connect_timeout, TcpStream::connect(&address));
            let connected = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = connect => result,
            };

            match connected {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    tracing::info!("Connected to {}", address);
                    match self.serve(stream, &mut shutdown).await {
                        Ok(()) => break,
                        Err(e) if e.is_fatal() => {
                            tracing::error!("Session stopped: {}", e);
                            self.set_state(SessionState::Disconnected);
                            return Err(e);
                        }
                        Err(e) => tracing::warn!("Connection to {} lost: {}", address, e),
                    }
                }
                Ok(Err(e)) => tracing::warn!("Failed to connect to {}: {}", address, e),
                Err(_) => tracing::warn!("Connecting to {} timed out after {:?}", address, connect_timeout),
            }

            self.set_state(SessionState::Disconnected);
            tracing::info!("Reconnecting in {:?}", backoff);
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        self.set_state(SessionState::Disconnected);
        tracing::info!("Session ended");
        Ok(())
    }

    /// Run one connection over an established stream.
    ///
    /// Returns `Ok` only on shutdown; a dropped connection is an error.
    pub async fn serve<S>(
        &mut self,
        stream: S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.begin_connection();
        let (reader, writer) = tokio::io::split(stream);
        let mut writer = FrameWriter::new(writer);

        // Frames are read on their own task so waiting for the next one can be
        // raced against shutdown and the probe timer without losing bytes.
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let mut reader = FrameReader::new(reader, self.config.server.read_timeout());
        let clock = self.handles.clock.clone();
        let read_task = tokio::spawn(async move {
            loop {
                let frame = reader.read_frame(clock.as_ref()).await;
                let failed = frame.is_err();
                if frame_tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
        });

        let result = self.stream_frames(&mut writer, frame_rx, shutdown).await;
        read_task.abort();
        result
    }

    async fn stream_frames<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut FrameWriter<W>,
        mut frames: mpsc::Receiver<Result<Frame>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        self.send_hello(writer).await?;
        self.set_state(SessionState::HandshakeSent);

        let mut probe_timer =
            tokio::time::interval(Duration::from_millis(TIME_PROBE_INTERVAL_MS));
        probe_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(()),
                frame = frames.recv() => {
                    let frame = frame.ok_or(NetworkError::Closed)??;
                    if self.state() != SessionState::Streaming {
                        self.set_state(SessionState::Streaming);
                    }
                    self.dispatch(frame).await?;
                    self.drive_output()?;
                }
                _ = probe_timer.tick() => {}
            }
            self.maybe_probe(writer).await?;
            self.log_stats();
        }
    }

    /// Forget everything tied to the previous connection
    fn begin_connection(&mut self) {
        self.stats.connections += 1;
        self.stream = None;
        self.last_probe_ms = None;
        self.handles.clock_model.write().reset();
        self.handles.time_sync.lock().reset();
    }

    fn next_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    async fn send_hello<W: AsyncWrite + Unpin>(&mut self, writer: &mut FrameWriter<W>) -> Result<()> {
        let id = self.next_id();
        let identity = &self.config.identity;
        let host_name = std::env::var("HOSTNAME").unwrap_or_else(|_| identity.name.clone());
        let hello = Hello::new(
            &identity.mac,
            &host_name,
            &identity.name,
            identity.instance,
            identity.client_id(),
        );
        let base = BaseMessage::new(MessageType::Hello, id, self.handles.clock.now(), 0);
        let frame = serialize(base, &Message::Hello(hello))?;
        writer.write_frame(&frame).await?;
        tracing::debug!("Hello sent as {} ({})", identity.name, identity.client_id());
        Ok(())
    }

    async fn maybe_probe<W: AsyncWrite + Unpin>(&mut self, writer: &mut FrameWriter<W>) -> Result<()> {
        let now_ms = self.handles.clock.millis();
        let due = match self.last_probe_ms {
            Some(last) => now_ms.saturating_sub(last) >= TIME_PROBE_INTERVAL_MS,
            None => true,
        };
        if !due {
            return Ok(());
        }
        let id = self.next_id();
        let frame = time_probe(id, self.handles.clock.now());
        writer.write_frame(&frame).await?;
        self.last_probe_ms = Some(now_ms);
        self.stats.probes_sent += 1;
        Ok(())
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<()> {
        self.stats.messages += 1;
        let Frame {
            base,
            body,
            received_ms,
        } = frame;
        let kind = match base.message_type() {
            Ok(kind) => kind,
            Err(e) => {
                tracing::debug!("Skipping message: {}", e);
                return Ok(());
            }
        };
        let message = match Message::decode(kind, body) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed += 1;
                tracing::warn!("Dropping malformed {:?} message: {}", kind, e);
                return Ok(());
            }
        };

        match message {
            Message::CodecHeader(header) => {
                self.stream = match StreamSpec::from_codec_header(&header) {
                    Ok(spec) if self.handles.registry.supports(spec.codec) => {
                        tracing::info!("Stream: {} {}", spec.codec, spec.format);
                        Some(Arc::new(spec))
                    }
                    Ok(spec) => {
                        tracing::warn!("No decoder for codec {}, audio refused", spec.codec);
                        None
                    }
                    Err(e) => {
                        tracing::warn!("Codec header rejected, audio refused: {}", e);
                        None
                    }
                };
            }
            Message::WireChunk(chunk) => self.queue_chunk(chunk).await?,
            Message::ServerSettings(settings) => self.apply_settings(settings),
            Message::Time(time) => self.apply_time(&base, received_ms, time),
            Message::StreamTags(tags) => tracing::debug!("Stream tags: {}", tags.json),
            Message::Hello(_) => tracing::debug!("Ignoring hello from server"),
        }
        Ok(())
    }

    async fn queue_chunk(&mut self, chunk: WireChunk) -> Result<()> {
        let Some(stream) = self.stream.clone() else {
            self.stats.chunks_dropped += 1;
            tracing::trace!("Chunk before a supported codec header, skipped");
            return Ok(());
        };
        let header = AudioHeader::new(chunk.timestamp, chunk.size() as u32, stream);
        let pushed = if self.driver.is_some() {
            self.push_cooperative(&header, &chunk.payload).await
        } else {
            self.writer.push(&header, &chunk.payload).await
        };
        match pushed {
            Ok(()) => self.stats.chunks_queued += 1,
            Err(PipelineError::Full) => {
                self.stats.chunks_dropped += 1;
                tracing::warn!(
                    "Pipeline full, dropping {} byte chunk at {}",
                    chunk.size(),
                    chunk.timestamp
                );
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Retry a push while playing queued chunks in between
    async fn push_cooperative(
        &mut self,
        header: &AudioHeader,
        payload: &[u8],
    ) -> std::result::Result<(), PipelineError> {
        let deadline = Instant::now() + self.config.buffer.write_wait();
        loop {
            match self.writer.try_push(header, payload) {
                Err(PipelineError::Full) => {}
                other => return other,
            }
            let progressed = match self.drive_output() {
                Ok(progressed) => progressed,
                Err(Error::Pipeline(e)) => return Err(e),
                Err(e) => {
                    tracing::warn!("Output error: {}", e);
                    false
                }
            };
            if !progressed {
                if Instant::now() >= deadline {
                    return Err(PipelineError::Full);
                }
                tokio::time::sleep(COOPERATIVE_RETRY).await;
            }
        }
    }

    /// Cooperative mode: play at most one chunk. Returns whether one was taken.
    fn drive_output(&mut self) -> Result<bool> {
        let Some(driver) = self.driver.as_mut() else {
            return Ok(false);
        };
        match blocking(|| driver.step()) {
            Ok(outcome) => Ok(outcome.is_some()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!("Output error: {}", e);
                Ok(true)
            }
        }
    }

    /// Apply the keys present in `update`; absent ones keep their last value
    fn apply_settings(&mut self, update: ServerSettings) {
        tracing::info!("Server settings: {}", update.to_json());
        self.settings.merge(&update);
        if let Some(volume) = update.volume {
            self.handles.volume.set_volume(volume);
        }
        if let Some(muted) = update.muted {
            self.handles.volume.set_muted(muted);
        }
        if update.buffer_ms.is_some() || update.latency.is_some() {
            self.handles
                .time_sync
                .lock()
                .set_message_buffer_delay(self.settings.buffer_delay_ms());
        }
    }

    fn apply_time(&mut self, base: &BaseMessage, received_ms: u64, time: TimeMessage) {
        let server_ms =
            self.handles
                .clock_model
                .write()
                .update(base.sent, base.received, time.latency);
        self.handles
            .time_sync
            .lock()
            .update_server_time(received_ms as i64, server_ms);
    }

    fn log_stats(&mut self) {
        if self.last_stats.elapsed() < STATS_INTERVAL {
            return;
        }
        let pipeline = self.writer.stats();
        tracing::debug!(
            "Session: {} messages, {} chunks queued, {} dropped, {} malformed, {} probes, pipeline {}/{} bytes free",
            self.stats.messages,
            self.stats.chunks_queued,
            self.stats.chunks_dropped,
            self.stats.malformed,
            self.stats.probes_sent,
            self.writer.free(),
            self.writer.capacity()
        );
        tracing::trace!("Pipeline: {:?}", pipeline);
        self.last_stats = Instant::now();
    }
}

/// Run output work that may sleep or poll the device.
///
/// On a multi-thread runtime the worker hands its other tasks off first;
/// a current-thread runtime cannot, so the call simply blocks.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
