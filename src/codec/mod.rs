//! Decoders for the codecs a server may announce
//!
//! Each stream gets a fresh decoder from the registry when its codec header
//! is first seen on the output side. Decoders produce interleaved `i16`.

pub mod decoder;
pub mod pcm;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CodecError;
use crate::protocol::{Codec, StreamSpec};

#[cfg(feature = "codec-opus")]
pub use decoder::OpusDecoder;
pub use pcm::PcmDecoder;

/// Turns encoded chunk payloads into PCM
pub trait Decoder: Send {
    fn begin(&mut self, stream: &StreamSpec) -> Result<(), CodecError>;

    /// Append the decoded samples of one chunk to `out`; returns frames
    fn decode(&mut self, data: &[u8], out: &mut Vec<i16>) -> Result<usize, CodecError>;

    fn end(&mut self);

    fn stats(&self) -> DecoderStats;
}

/// Decoder statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Packets decoded
    pub frames_decoded: u64,
    /// Packets that failed to decode
    pub frames_failed: u64,
}

type DecoderFactory = Box<dyn Fn() -> Box<dyn Decoder> + Send + Sync>;

/// Decoder constructors keyed by codec
pub struct DecoderRegistry {
    factories: HashMap<Codec, DecoderFactory>,
}

/// Thread-safe handle to a registry
pub type SharedRegistry = Arc<DecoderRegistry>;

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Every decoder compiled into this build
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Codec::Pcm, || Box::new(PcmDecoder::new()));
        #[cfg(feature = "codec-opus")]
        registry.register(Codec::Opus, || Box::new(OpusDecoder::new()));
        registry
    }

    pub fn register<F>(&mut self, codec: Codec, factory: F)
    where
        F: Fn() -> Box<dyn Decoder> + Send + Sync + 'static,
    {
        self.factories.insert(codec, Box::new(factory));
    }

    pub fn supports(&self, codec: Codec) -> bool {
        self.factories.contains_key(&codec)
    }

    pub fn codecs(&self) -> Vec<Codec> {
        let mut codecs: Vec<Codec> = self.factories.keys().copied().collect();
        codecs.sort_by_key(|c| c.name());
        codecs
    }

    pub fn create(&self, codec: Codec) -> Result<Box<dyn Decoder>, CodecError> {
        self.factories
            .get(&codec)
            .map(|factory| factory())
            .ok_or_else(|| CodecError::NoDecoder(codec.to_string()))
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
