//! Output stage: synchronize, decode, resample, scale, play
//!
//! The stage owns the decoder and the sink. It reconfigures itself whenever a
//! chunk carries a different stream than the one active, so every chunk is
//! decoded under the codec header that was current when it was queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{AudioHeader, PipelineReader};
use crate::audio::device::Sink;
use crate::audio::resample::LinearResampler;
use crate::audio::volume::SharedVolume;
use crate::codec::{Decoder, DecoderStats, SharedRegistry};
use crate::error::{Error, PipelineError, Result};
use crate::protocol::{AudioFormat, StreamSpec};
use crate::sync::{SharedClock, SharedClockModel, SharedTimeSync, SyncDecision};

/// Poll period while the pipeline fills up to its activation threshold
const ACTIVATION_POLL: Duration = Duration::from_millis(5);

/// Upper bound of one blocking pop so `stop` stays responsive
const POP_SLICE: Duration = Duration::from_millis(100);

/// Upper bound of one start-delay sleep, for the same reason
const START_SLICE: Duration = Duration::from_millis(50);

/// Why a chunk never reached the sink
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DropReason {
    Late(i64),
    Implausible(i64),
    NoClock,
    NoDecoder,
    Decode,
    /// Stopped during the start delay
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkOutcome {
    Played { frames: usize },
    Dropped(DropReason),
}

/// Output statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub chunks_played: u64,
    pub chunks_dropped: u64,
    pub frames_written: u64,
    pub stream_changes: u64,
}

pub struct OutputStage {
    registry: SharedRegistry,
    sink: Box<dyn Sink>,
    clock: SharedClock,
    clock_model: SharedClockModel,
    time_sync: SharedTimeSync,
    volume: SharedVolume,
    stream: Option<Arc<StreamSpec>>,
    decoder: Option<Box<dyn Decoder>>,
    resampler: LinearResampler,
    decoded: Vec<i16>,
    resampled: Vec<i16>,
    /// Frames of the last chunk played, for filling gaps
    last_frames: usize,
    /// Cleared by `OutputHandle::stop`
    running: Arc<AtomicBool>,
    stats: OutputStats,
}

impl OutputStage {
    pub fn new(
        registry: SharedRegistry,
        sink: Box<dyn Sink>,
        clock: SharedClock,
        clock_model: SharedClockModel,
        time_sync: SharedTimeSync,
        volume: SharedVolume,
    ) -> Self {
        Self {
            registry,
            sink,
            clock,
            clock_model,
            time_sync,
            volume,
            stream: None,
            decoder: None,
            resampler: LinearResampler::new(2),
            decoded: Vec::new(),
            resampled: Vec::new(),
            last_frames: 0,
            running: Arc::new(AtomicBool::new(true)),
            stats: OutputStats::default(),
        }
    }

    pub fn stats(&self) -> &OutputStats {
        &self.stats
    }

    /// Statistics of the current stream's decoder
    pub fn decoder_stats(&self) -> Option<DecoderStats> {
        self.decoder.as_ref().map(|decoder| decoder.stats())
    }

    /// Play one chunk popped from the pipeline
    pub fn process(&mut self, header: &AudioHeader, payload: &[u8]) -> Result<ChunkOutcome> {
        let changed = match &self.stream {
            Some(active) => !Arc::ptr_eq(active, &header.stream),
            None => true,
        };
        if changed {
            self.reconfigure(header.stream.clone())?;
        }

        let outcome = self.play(header, payload)?;
        match outcome {
            ChunkOutcome::Played { frames } => {
                self.stats.chunks_played += 1;
                self.stats.frames_written += frames as u64;
            }
            ChunkOutcome::Dropped(reason) => {
                self.stats.chunks_dropped += 1;
                tracing::debug!("Dropped chunk at {}: {:?}", header.timestamp(), reason);
            }
        }
        Ok(outcome)
    }

    fn reconfigure(&mut self, stream: Arc<StreamSpec>) -> Result<()> {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.end();
        }
        if self.stream.is_some() {
            self.sink.end();
        }
        self.stats.stream_changes += 1;
        tracing::info!("Starting {} stream, {}", stream.codec, stream.format);

        self.decoder = match self.registry.create(stream.codec) {
            Ok(mut decoder) => match decoder.begin(&stream) {
                Ok(()) => Some(decoder),
                Err(e) => {
                    tracing::error!("Failed to start {} decoder: {}", stream.codec, e);
                    None
                }
            },
            Err(e) => {
                tracing::error!("{}", e);
                None
            }
        };

        let format = AudioFormat::new(stream.format.sample_rate, stream.format.channels, 16);
        self.resampler.reset(format.channels);
        self.last_frames = 0;
        self.time_sync.lock().begin();
        self.stream = Some(stream);

        self.sink.set_format(format)?;
        self.sink.begin()?;
        Ok(())
    }

    fn play(&mut self, header: &AudioHeader, payload: &[u8]) -> Result<ChunkOutcome> {
        if self.decoder.is_none() {
            return Ok(ChunkOutcome::Dropped(DropReason::NoDecoder));
        }

        let server_now = self.clock_model.read().server_now_ms(self.clock.now());
        let decision = self
            .time_sync
            .lock()
            .synchronize(header.timestamp().as_millis(), server_now);

        let factor = match decision {
            SyncDecision::Play { factor } => factor,
            SyncDecision::Wait(delay) => {
                tracing::info!("Starting playback in {} ms", delay.as_millis());
                if !self.wait_start(delay) {
                    return Ok(ChunkOutcome::Dropped(DropReason::Stopped));
                }
                let mut time_sync = self.time_sync.lock();
                time_sync.mark_started();
                time_sync.current_factor()
            }
            SyncDecision::DropLate(late) => {
                return Ok(ChunkOutcome::Dropped(DropReason::Late(late)))
            }
            SyncDecision::DropImplausible(delay) => {
                tracing::warn!("Implausible start delay of {} ms", delay);
                return Ok(ChunkOutcome::Dropped(DropReason::Implausible(delay)));
            }
            SyncDecision::DropNoClock => return Ok(ChunkOutcome::Dropped(DropReason::NoClock)),
        };

        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(ChunkOutcome::Dropped(DropReason::NoDecoder));
        };
        self.decoded.clear();
        if let Err(e) = decoder.decode(payload, &mut self.decoded) {
            tracing::warn!("{}", e);
            // keep the timeline continuous after a corrupt chunk
            if self.last_frames > 0 {
                self.sink.write_silence(self.last_frames)?;
            }
            return Ok(ChunkOutcome::Dropped(DropReason::Decode));
        }

        self.resampled.clear();
        self.resampler
            .process(&self.decoded, factor, &mut self.resampled);
        self.volume.apply(&mut self.resampled);

        let frames = self.sink.write(&self.resampled)?;
        self.last_frames = frames;
        Ok(ChunkOutcome::Played { frames })
    }

    /// Sleep out the start delay; false if stopped meanwhile
    fn wait_start(&self, delay: Duration) -> bool {
        let mut left = delay;
        while !left.is_zero() {
            if !self.running.load(Ordering::Relaxed) {
                return false;
            }
            let slice = left.min(START_SLICE);
            self.clock.sleep(slice);
            left -= slice;
        }
        true
    }

    /// Stop and hand the sink back for reuse
    pub fn into_sink(mut self) -> Box<dyn Sink> {
        self.stop();
        self.sink
    }

    /// Release the decoder and close the sink
    pub fn stop(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.end();
        }
        if self.stream.take().is_some() {
            self.sink.end();
        }
    }
}

/// Drains the pipeline into the output stage
pub struct OutputDriver {
    reader: PipelineReader,
    stage: OutputStage,
    pop_timeout: Duration,
    buf: Vec<u8>,
}

impl OutputDriver {
    pub fn new(reader: PipelineReader, stage: OutputStage, pop_timeout: Duration) -> Self {
        Self {
            reader,
            stage,
            pop_timeout,
            buf: Vec::new(),
        }
    }

    pub fn reader(&self) -> &PipelineReader {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut PipelineReader {
        &mut self.reader
    }

    pub fn stage(&self) -> &OutputStage {
        &self.stage
    }

    pub fn into_parts(self) -> (PipelineReader, OutputStage) {
        (self.reader, self.stage)
    }

    /// Play at most one queued chunk without waiting for it
    pub fn step(&mut self) -> Result<Option<ChunkOutcome>> {
        match self.reader.try_pop(&mut self.buf)? {
            Some(header) => self.stage.process(&header, &self.buf).map(Some),
            None => Ok(None),
        }
    }

    /// Run on a dedicated thread until stopped or the writer goes away
    pub fn spawn(self) -> std::io::Result<OutputHandle> {
        let running = self.stage.running.clone();
        running.store(true, Ordering::SeqCst);
        let running_for_loop = running.clone();
        let handle = thread::Builder::new()
            .name("snap-output".into())
            .spawn(move || self.run(&running_for_loop))?;
        Ok(OutputHandle {
            running,
            handle: Some(handle),
        })
    }

    fn run(mut self, running: &AtomicBool) -> OutputDriver {
        let mut waited = Duration::ZERO;
        let mut last_stats = Instant::now();

        while running.load(Ordering::Relaxed) {
            if !self.reader.poll_activation() {
                if self.reader.is_closed() {
                    break;
                }
                thread::sleep(ACTIVATION_POLL);
                continue;
            }

            let slice = POP_SLICE.min(self.pop_timeout);
            match self.reader.pop_timeout(&mut self.buf, slice) {
                Ok(Some(header)) => {
                    waited = Duration::ZERO;
                    if let Err(e) = self.stage.process(&header, &self.buf) {
                        tracing::error!("Output error: {}", e);
                        if e.is_fatal() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    waited += slice;
                    if waited >= self.pop_timeout {
                        tracing::warn!("No audio received for {:?}", waited);
                        waited = Duration::ZERO;
                    }
                }
                Err(PipelineError::Closed) => break,
                Err(e) => tracing::warn!("Pipeline error: {}", e),
            }

            if last_stats.elapsed() >= Duration::from_secs(10) {
                let stats = self.stage.stats();
                let decoder = self.stage.decoder_stats().unwrap_or_default();
                tracing::debug!(
                    "Output: {} played, {} dropped, {} frames, {} decoded, {} decode errors, pipeline {}/{} bytes",
                    stats.chunks_played,
                    stats.chunks_dropped,
                    stats.frames_written,
                    decoder.frames_decoded,
                    decoder.frames_failed,
                    self.reader.fill(),
                    self.reader.capacity()
                );
                last_stats = Instant::now();
            }
        }

        self.stage.stop();
        tracing::debug!("Output thread stopped");
        self
    }
}

/// Handle to a running output thread
pub struct OutputHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<OutputDriver>>,
}

impl OutputHandle {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and hand the driver back
    pub fn stop(mut self) -> Result<OutputDriver> {
        self.running.store(false, Ordering::SeqCst);
        let handle = self
            .handle
            .take()
            .ok_or_else(|| Error::Config("output thread already stopped".into()))?;
        handle
            .join()
            .map_err(|_| Error::Config("output thread panicked".into()))
    }
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{pipeline, PipelineOptions};
    use crate::audio::volume::VolumeControl;
    use crate::codec::DecoderRegistry;
    use crate::config::SyncConfig;
    use crate::error::AudioError;
    use crate::protocol::{Codec, TimeVal};
    use crate::sync::{Clock, ClockModel, ManualClock, TimeSync};
    use bytes::Bytes;
    use parking_lot::{Mutex, RwLock};

    #[derive(Clone, Default)]
    struct RecordingSink {
        writes: Arc<Mutex<Vec<Vec<i16>>>>,
        begins: Arc<Mutex<Vec<AudioFormat>>>,
        format: AudioFormat,
    }

    impl Sink for RecordingSink {
        fn set_format(&mut self, format: AudioFormat) -> std::result::Result<(), AudioError> {
            self.format = format;
            Ok(())
        }
        fn begin(&mut self) -> std::result::Result<(), AudioError> {
            self.begins.lock().push(self.format);
            Ok(())
        }
        fn write(&mut self, samples: &[i16]) -> std::result::Result<usize, AudioError> {
            self.writes.lock().push(samples.to_vec());
            Ok(samples.len() / self.format.channels as usize)
        }
        fn write_silence(&mut self, _frames: usize) -> std::result::Result<(), AudioError> {
            Ok(())
        }
        fn end(&mut self) {}
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        time_sync: SharedTimeSync,
        volume: SharedVolume,
        sink: RecordingSink,
        stage: OutputStage,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(TimeVal::new(1_000, 0)));
        let mut model = ClockModel::new();
        // server clock equal to ours
        let now = clock.now();
        model.update(now, now, TimeVal::ZERO);
        let clock_model = Arc::new(RwLock::new(model));
        let time_sync = Arc::new(Mutex::new(TimeSync::new(&SyncConfig {
            processing_lag_ms: 0,
            ..Default::default()
        })));
        time_sync.lock().set_message_buffer_delay(30);
        let volume: SharedVolume = Arc::new(VolumeControl::default());
        let sink = RecordingSink::default();
        let stage = OutputStage::new(
            Arc::new(DecoderRegistry::with_defaults()),
            Box::new(sink.clone()),
            clock.clone(),
            clock_model,
            time_sync.clone(),
            volume.clone(),
        );
        Fixture {
            clock,
            time_sync,
            volume,
            sink,
            stage,
        }
    }

    fn pcm_stream(rate: u32) -> Arc<StreamSpec> {
        Arc::new(StreamSpec {
            codec: Codec::Pcm,
            format: AudioFormat::new(rate, 2, 16),
            header: Bytes::new(),
        })
    }

    fn payload(value: i16, frames: usize) -> Vec<u8> {
        value.to_le_bytes().repeat(frames * 2)
    }

    #[test]
    fn test_start_delay_waits_once() {
        let mut f = fixture();
        let stream = pcm_stream(48000);
        let start = f.clock.now();

        let first = AudioHeader::new(start, 0, stream.clone());
        let outcome = f.stage.process(&first, &payload(100, 4)).unwrap();
        assert_eq!(outcome, ChunkOutcome::Played { frames: 4 });
        assert_eq!(f.clock.sleeps(), vec![Duration::from_millis(30)]);
        assert!(f.time_sync.lock().is_started());

        let second = AudioHeader::new(TimeVal::from_millis(start.as_millis() + 20), 0, stream);
        f.stage.process(&second, &payload(200, 4)).unwrap();
        assert_eq!(f.clock.sleeps().len(), 1);
        assert_eq!(f.sink.writes.lock().len(), 2);
        assert_eq!(f.sink.writes.lock()[1], vec![200i16; 8]);
    }

    #[test]
    fn test_start_delay_sleeps_in_slices() {
        let mut f = fixture();
        f.time_sync.lock().set_message_buffer_delay(120);
        let now = f.clock.now();
        f.stage
            .process(&AudioHeader::new(now, 0, pcm_stream(48000)), &payload(1, 2))
            .unwrap();
        assert_eq!(
            f.clock.sleeps(),
            vec![
                Duration::from_millis(50),
                Duration::from_millis(50),
                Duration::from_millis(20)
            ]
        );
    }

    #[test]
    fn test_stop_interrupts_start_delay() {
        let mut f = fixture();
        f.time_sync.lock().set_message_buffer_delay(100_000);
        f.stage.running.store(false, Ordering::SeqCst);
        let now = f.clock.now();
        assert_eq!(
            f.stage
                .process(&AudioHeader::new(now, 0, pcm_stream(48000)), &payload(1, 2))
                .unwrap(),
            ChunkOutcome::Dropped(DropReason::Stopped)
        );
        assert!(f.clock.sleeps().is_empty());
        assert!(!f.time_sync.lock().is_started());
        assert!(f.sink.writes.lock().is_empty());
    }

    #[test]
    fn test_late_chunk_dropped() {
        let mut f = fixture();
        let header = AudioHeader::new(
            TimeVal::from_millis(f.clock.now().as_millis() - 80),
            0,
            pcm_stream(48000),
        );
        assert_eq!(
            f.stage.process(&header, &payload(1, 4)).unwrap(),
            ChunkOutcome::Dropped(DropReason::Late(50))
        );
        assert!(f.sink.writes.lock().is_empty());
        assert!(f.clock.sleeps().is_empty());
        assert_eq!(f.stage.stats().chunks_dropped, 1);
    }

    #[test]
    fn test_new_stream_reconfigures_and_regates() {
        let mut f = fixture();
        let now = f.clock.now();
        f.stage
            .process(&AudioHeader::new(now, 0, pcm_stream(48000)), &payload(1, 2))
            .unwrap();

        let next = pcm_stream(44100);
        let later = TimeVal::from_millis(f.clock.now().as_millis());
        f.stage
            .process(&AudioHeader::new(later, 0, next), &payload(1, 2))
            .unwrap();

        let begins = f.sink.begins.lock().clone();
        assert_eq!(
            begins,
            vec![AudioFormat::new(48000, 2, 16), AudioFormat::new(44100, 2, 16)]
        );
        assert_eq!(f.clock.sleeps().len(), 2);
        assert_eq!(f.stage.stats().stream_changes, 2);
    }

    #[test]
    fn test_decode_error_and_unsupported_codec_drop() {
        let mut f = fixture();
        let stream = pcm_stream(48000);
        let now = f.clock.now();
        f.stage
            .process(&AudioHeader::new(now, 0, stream.clone()), &payload(1, 2))
            .unwrap();
        assert_eq!(
            f.stage
                .process(&AudioHeader::new(now, 0, stream), &[0u8; 3])
                .unwrap(),
            ChunkOutcome::Dropped(DropReason::Decode)
        );
        assert_eq!(
            f.stage.decoder_stats(),
            Some(DecoderStats {
                frames_decoded: 1,
                frames_failed: 1
            })
        );

        let flac = Arc::new(StreamSpec {
            codec: Codec::Flac,
            format: AudioFormat::default(),
            header: Bytes::new(),
        });
        assert_eq!(
            f.stage
                .process(&AudioHeader::new(now, 0, flac), &[0u8; 4])
                .unwrap(),
            ChunkOutcome::Dropped(DropReason::NoDecoder)
        );
        assert_eq!(f.sink.writes.lock().len(), 1);
    }

    #[test]
    fn test_mute_writes_zeros() {
        let mut f = fixture();
        let stream = pcm_stream(48000);
        let now = f.clock.now();
        f.stage
            .process(&AudioHeader::new(now, 0, stream.clone()), &payload(500, 2))
            .unwrap();
        f.volume.set_muted(true);
        f.stage
            .process(&AudioHeader::new(now, 0, stream), &payload(500, 2))
            .unwrap();
        let writes = f.sink.writes.lock();
        assert_eq!(writes[0], vec![500i16; 4]);
        assert_eq!(writes[1], vec![0i16; 4]);
    }

    #[test]
    fn test_driver_step_and_thread() {
        let f = fixture();
        let (mut writer, reader) = pipeline(PipelineOptions {
            capacity: 64,
            activation_bytes: 0,
            max_chunks: 8,
            write_wait: Duration::from_millis(10),
        });
        let stream = pcm_stream(48000);
        let now = f.clock.now();
        writer
            .try_push(&AudioHeader::new(now, 0, stream.clone()), &payload(7, 2))
            .unwrap();

        let mut driver = OutputDriver::new(reader, f.stage, Duration::from_millis(50));
        assert!(matches!(
            driver.step().unwrap(),
            Some(ChunkOutcome::Played { frames: 2 })
        ));
        assert!(driver.step().unwrap().is_none());

        let handle = driver.spawn().unwrap();
        writer
            .try_push(&AudioHeader::new(now, 0, stream), &payload(9, 2))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while f.sink.writes.lock().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let driver = handle.stop().unwrap();
        assert_eq!(driver.stage().stats().chunks_played, 2);
        assert_eq!(f.sink.writes.lock()[1], vec![9i16; 4]);
    }
}
