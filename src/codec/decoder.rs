//! Opus decoder wrapper
//!
//! Provides Opus decoding of wire chunks into interleaved 16-bit PCM.

#![cfg(feature = "codec-opus")]

use opus::Channels;

use crate::codec::{Decoder, DecoderStats};
use crate::error::CodecError;
use crate::protocol::StreamSpec;

/// Longest Opus frame in milliseconds
const MAX_FRAME_MS: usize = 120;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Option<opus::Decoder>,
    channels: u16,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    /// Frames decoded
    frames_decoded: u64,
    /// Packets that failed to decode
    frames_failed: u64,
}

impl OpusDecoder {
    pub fn new() -> Self {
        Self {
            decoder: None,
            channels: 0,
            decode_buffer: Vec::new(),
            frames_decoded: 0,
            frames_failed: 0,
        }
    }
}

impl Default for OpusDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for OpusDecoder {
    fn begin(&mut self, stream: &StreamSpec) -> Result<(), CodecError> {
        let format = stream.format;
        let opus_channels = match format.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    format.channels
                )))
            }
        };

        let decoder = opus::Decoder::new(format.sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // 120ms at the stream rate
        let max_samples =
            format.sample_rate as usize * MAX_FRAME_MS / 1000 * format.channels as usize;
        self.decode_buffer = vec![0i16; max_samples];
        self.channels = format.channels;
        self.decoder = Some(decoder);
        tracing::debug!("Opus decoder ready for {}", format);
        Ok(())
    }

    fn decode(&mut self, data: &[u8], out: &mut Vec<i16>) -> Result<usize, CodecError> {
        let decoder = self.decoder.as_mut().ok_or(CodecError::NotStarted)?;
        let frames = match decoder.decode(data, &mut self.decode_buffer, false) {
            Ok(frames) => frames,
            Err(e) => {
                self.frames_failed += 1;
                return Err(CodecError::DecodingFailed(e.to_string()));
            }
        };

        let total_samples = frames * self.channels as usize;
        out.extend_from_slice(&self.decode_buffer[..total_samples]);
        self.frames_decoded += 1;
        Ok(frames)
    }

    fn end(&mut self) {
        self.decoder = None;
    }

    fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_failed: self.frames_failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::format::opus_header;
    use crate::protocol::{AudioFormat, Codec};

    fn stream(sample_rate: u32, channels: u16) -> StreamSpec {
        let format = AudioFormat::new(sample_rate, channels, 16);
        StreamSpec {
            codec: Codec::Opus,
            format,
            header: opus_header(&format),
        }
    }

    #[test]
    fn test_decoder_rejects_surround() {
        let mut decoder = OpusDecoder::new();
        assert!(decoder.begin(&stream(48000, 6)).is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder =
            opus::Encoder::new(48000, Channels::Stereo, opus::Application::Audio).unwrap();
        let mut decoder = OpusDecoder::new();
        decoder.begin(&stream(48000, 2)).unwrap();

        // 20 ms of a 440 Hz sine wave
        let frame_size = 960;
        let mut samples: Vec<i16> = Vec::with_capacity(frame_size * 2);
        for i in 0..frame_size {
            let t = i as f32 / 48000.0;
            let val = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 16000.0) as i16;
            samples.push(val); // Left
            samples.push(val); // Right
        }

        let mut packet = vec![0u8; 4000];
        let len = encoder.encode(&samples, &mut packet).unwrap();

        let mut out = Vec::new();
        let frames = decoder.decode(&packet[..len], &mut out).unwrap();
        assert_eq!(frames, frame_size);
        assert_eq!(out.len(), frame_size * 2);
        assert_eq!(decoder.stats().frames_decoded, 1);
    }

    #[test]
    fn test_decode_before_begin() {
        let mut decoder = OpusDecoder::new();
        let mut out = Vec::new();
        assert!(matches!(
            decoder.decode(&[0u8; 4], &mut out),
            Err(CodecError::NotStarted)
        ));
    }
}
