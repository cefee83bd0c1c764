//! Audio sinks and output device handling

use crate::error::AudioError;
use crate::protocol::AudioFormat;

/// Final destination of decoded, scaled PCM
pub trait Sink: Send {
    /// Reconfigure for a new stream; takes effect on the next `begin`
    fn set_format(&mut self, format: AudioFormat) -> Result<(), AudioError>;

    fn begin(&mut self) -> Result<(), AudioError>;

    /// Write interleaved samples; returns the frames accepted
    fn write(&mut self, samples: &[i16]) -> Result<usize, AudioError>;

    fn write_silence(&mut self, frames: usize) -> Result<(), AudioError>;

    fn end(&mut self);
}

/// Discards everything; used when no output backend is compiled in
#[derive(Debug, Default)]
pub struct NullSink {
    format: AudioFormat,
    frames: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }
}

impl Sink for NullSink {
    fn set_format(&mut self, format: AudioFormat) -> Result<(), AudioError> {
        self.format = format;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize, AudioError> {
        let frames = samples.len() / self.format.channels.max(1) as usize;
        self.frames += frames as u64;
        Ok(frames)
    }

    fn write_silence(&mut self, frames: usize) -> Result<(), AudioError> {
        self.frames += frames as u64;
        Ok(())
    }

    fn end(&mut self) {}
}

/// Output device description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

#[cfg(feature = "output-cpal")]
pub use self::cpal_output::{find_output_device, list_output_devices, CpalSink};

#[cfg(feature = "output-cpal")]
mod cpal_output {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use crossbeam::queue::ArrayQueue;
    use crossbeam_channel::{bounded, Receiver};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::{AudioDeviceInfo, Sink};
    use crate::error::AudioError;
    use crate::protocol::AudioFormat;

    /// Blocks queued between `write` and the device callback
    const QUEUE_BLOCKS: usize = 16;

    /// List output devices with the rates and channel counts they support
    pub fn list_output_devices() -> Vec<AudioDeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        let mut devices = Vec::new();

        if let Ok(outputs) = host.output_devices() {
            for device in outputs {
                let Ok(name) = device.name() else { continue };
                let (sample_rates, channels) = device_capabilities(&device);
                devices.push(AudioDeviceInfo {
                    is_default: default_name.as_ref() == Some(&name),
                    name,
                    sample_rates,
                    channels,
                });
            }
        }
        devices
    }

    fn device_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
        let mut rates = Vec::new();
        let mut channels = Vec::new();
        if let Ok(configs) = device.supported_output_configs() {
            for config in configs {
                for rate_val in [44100u32, 48000, 88200, 96000] {
                    let rate = cpal::SampleRate(rate_val);
                    if rate >= config.min_sample_rate()
                        && rate <= config.max_sample_rate()
                        && !rates.contains(&rate_val)
                    {
                        rates.push(rate_val);
                    }
                }
                if !channels.contains(&config.channels()) {
                    channels.push(config.channels());
                }
            }
        }
        rates.sort();
        channels.sort();
        (rates, channels)
    }

    /// Output device by name, or the default device
    pub fn find_output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        let Some(name) = name else {
            return host
                .default_output_device()
                .ok_or_else(|| AudioError::DeviceNotFound("No default output device".into()));
        };
        let devices = host
            .output_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        for device in devices {
            if device.name().ok().as_deref() == Some(name) {
                return Ok(device);
            }
        }
        Err(AudioError::DeviceNotFound(name.to_string()))
    }

    /// Sink playing through a cpal output stream.
    ///
    /// The stream lives on its own thread; `write` hands blocks of samples
    /// over a bounded queue and waits while it is full, which paces the
    /// output driver at the device rate. The callback plays silence when the
    /// queue runs dry.
    pub struct CpalSink {
        device_name: Option<String>,
        format: AudioFormat,
        queue: Arc<ArrayQueue<Vec<i16>>>,
        running: Arc<AtomicBool>,
        underruns: Arc<AtomicU64>,
        thread_handle: Option<JoinHandle<()>>,
        error_rx: Option<Receiver<AudioError>>,
    }

    impl CpalSink {
        pub fn new(device_name: Option<String>) -> Self {
            Self {
                device_name,
                format: AudioFormat::default(),
                queue: Arc::new(ArrayQueue::new(QUEUE_BLOCKS)),
                running: Arc::new(AtomicBool::new(false)),
                underruns: Arc::new(AtomicU64::new(0)),
                thread_handle: None,
                error_rx: None,
            }
        }

        pub fn underruns(&self) -> u64 {
            self.underruns.load(Ordering::Relaxed)
        }

        fn check_errors(&self) -> Result<(), AudioError> {
            if let Some(error_rx) = &self.error_rx {
                if let Ok(err) = error_rx.try_recv() {
                    return Err(err);
                }
            }
            Ok(())
        }

        fn enqueue(&mut self, mut block: Vec<i16>) -> Result<(), AudioError> {
            loop {
                if !self.running.load(Ordering::Relaxed) {
                    return Err(AudioError::NotStarted);
                }
                match self.queue.push(block) {
                    Ok(()) => return Ok(()),
                    Err(rejected) => {
                        block = rejected;
                        self.check_errors()?;
                        thread::sleep(Duration::from_millis(2));
                    }
                }
            }
        }
    }

    impl Sink for CpalSink {
        fn set_format(&mut self, format: AudioFormat) -> Result<(), AudioError> {
            if format.channels == 0 || format.sample_rate == 0 {
                return Err(AudioError::UnsupportedFormat(format.to_string()));
            }
            self.format = format;
            Ok(())
        }

        fn begin(&mut self) -> Result<(), AudioError> {
            if self.running.load(Ordering::SeqCst) {
                self.end();
            }

            let device = find_output_device(self.device_name.as_deref())?;
            let config = cpal::StreamConfig {
                channels: self.format.channels,
                sample_rate: cpal::SampleRate(self.format.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let (error_tx, error_rx) = bounded::<AudioError>(16);
            self.error_rx = Some(error_rx);

            let running = self.running.clone();
            let running_for_loop = self.running.clone();
            let queue = self.queue.clone();
            let underruns = self.underruns.clone();
            running.store(true, Ordering::SeqCst);

            tracing::info!(
                "Opening output {} at {}",
                self.device_name.as_deref().unwrap_or("(default)"),
                self.format
            );

            let handle = thread::Builder::new()
                .name("snap-sink".into())
                .spawn(move || {
                    let mut current: Vec<i16> = Vec::new();
                    let mut offset = 0usize;
                    let stream_error_tx = error_tx.clone();

                    let stream = device.build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let mut starved = false;
                            for out in data.iter_mut() {
                                if offset >= current.len() {
                                    match queue.pop() {
                                        Some(block) => {
                                            current = block;
                                            offset = 0;
                                        }
                                        None => {
                                            starved = true;
                                            *out = 0.0;
                                            continue;
                                        }
                                    }
                                }
                                *out = current[offset] as f32 / 32768.0;
                                offset += 1;
                            }
                            if starved {
                                underruns.fetch_add(1, Ordering::Relaxed);
                            }
                        },
                        move |err| {
                            let _ = stream_error_tx.try_send(AudioError::StreamError(err.to_string()));
                        },
                        None,
                    );

                    match stream {
                        Ok(stream) => {
                            if let Err(e) = stream.play() {
                                tracing::error!("Failed to start output stream: {}", e);
                                let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                                running_for_loop.store(false, Ordering::SeqCst);
                                return;
                            }
                            while running_for_loop.load(Ordering::Relaxed) {
                                thread::sleep(Duration::from_millis(10));
                            }
                        }
                        Err(e) => {
                            tracing::error!("Failed to build output stream: {}", e);
                            let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                            running_for_loop.store(false, Ordering::SeqCst);
                        }
                    }
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?;

            self.thread_handle = Some(handle);
            Ok(())
        }

        fn write(&mut self, samples: &[i16]) -> Result<usize, AudioError> {
            self.check_errors()?;
            let channels = self.format.channels.max(1) as usize;
            let frames = samples.len() / channels;
            if frames > 0 {
                self.enqueue(samples[..frames * channels].to_vec())?;
            }
            Ok(frames)
        }

        fn write_silence(&mut self, frames: usize) -> Result<(), AudioError> {
            let channels = self.format.channels.max(1) as usize;
            self.enqueue(vec![0; frames * channels])
        }

        fn end(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
            while self.queue.pop().is_some() {}
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sink_counts_frames() {
        let mut sink = NullSink::new();
        sink.set_format(AudioFormat::new(48000, 2, 16)).unwrap();
        sink.begin().unwrap();
        assert_eq!(sink.write(&[0i16; 960]).unwrap(), 480);
        sink.write_silence(20).unwrap();
        assert_eq!(sink.frames_written(), 500);
    }
}
