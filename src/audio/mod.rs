//! Audio subsystem: pipeline, output stage and sinks

pub mod buffer;
pub mod device;
pub mod output;
pub mod resample;
pub mod volume;

pub use buffer::{
    pipeline, AudioHeader, PipelineOptions, PipelineReader, PipelineStats, PipelineWriter,
};
pub use device::{AudioDeviceInfo, NullSink, Sink};
pub use output::{ChunkOutcome, DropReason, OutputDriver, OutputHandle, OutputStage, OutputStats};
pub use resample::LinearResampler;
pub use volume::{SharedVolume, VolumeControl};

#[cfg(feature = "output-cpal")]
pub use device::{find_output_device, list_output_devices, CpalSink};
