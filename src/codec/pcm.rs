//! Raw PCM "decoding": sample width conversion to 16 bit

use crate::codec::{Decoder, DecoderStats};
use crate::error::CodecError;
use crate::protocol::{AudioFormat, StreamSpec};

#[derive(Debug, Default)]
pub struct PcmDecoder {
    format: Option<AudioFormat>,
    stats: DecoderStats,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for PcmDecoder {
    fn begin(&mut self, stream: &StreamSpec) -> Result<(), CodecError> {
        match stream.format.bits_per_sample {
            8 | 16 | 24 | 32 => {}
            bits => {
                return Err(CodecError::DecoderInit(format!(
                    "unsupported PCM sample width: {} bits",
                    bits
                )))
            }
        }
        if stream.format.channels == 0 {
            return Err(CodecError::DecoderInit("PCM stream without channels".into()));
        }
        self.format = Some(stream.format);
        Ok(())
    }

    fn decode(&mut self, data: &[u8], out: &mut Vec<i16>) -> Result<usize, CodecError> {
        let format = self.format.ok_or(CodecError::NotStarted)?;
        let frame_size = format.frame_size();
        if data.len() % frame_size != 0 {
            self.stats.frames_failed += 1;
            return Err(CodecError::DecodingFailed(format!(
                "{} bytes is not a whole number of {}-byte frames",
                data.len(),
                frame_size
            )));
        }

        let width = format.bits_per_sample as usize / 8;
        out.reserve(data.len() / width);
        for sample in data.chunks_exact(width) {
            let value = match width {
                1 => ((sample[0] as i16) - 128) << 8,
                2 => i16::from_le_bytes([sample[0], sample[1]]),
                3 => i16::from_le_bytes([sample[1], sample[2]]),
                _ => i16::from_le_bytes([sample[2], sample[3]]),
            };
            out.push(value);
        }
        self.stats.frames_decoded += 1;
        Ok(data.len() / frame_size)
    }

    fn end(&mut self) {
        self.format = None;
    }

    fn stats(&self) -> DecoderStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Codec;
    use bytes::Bytes;

    fn stream(bits: u16) -> StreamSpec {
        StreamSpec {
            codec: Codec::Pcm,
            format: AudioFormat::new(48000, 2, bits),
            header: Bytes::new(),
        }
    }

    #[test]
    fn test_16_bit_passthrough() {
        let mut decoder = PcmDecoder::new();
        decoder.begin(&stream(16)).unwrap();
        let samples = [1i16, -2, 300, -32768];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut out = Vec::new();
        assert_eq!(decoder.decode(&bytes, &mut out).unwrap(), 2);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_wide_samples_keep_high_bits() {
        let mut decoder = PcmDecoder::new();
        decoder.begin(&stream(24)).unwrap();
        let mut out = Vec::new();
        // 0x123456 and -1 (0xFFFFFF)
        decoder
            .decode(&[0x56, 0x34, 0x12, 0xFF, 0xFF, 0xFF], &mut out)
            .unwrap();
        assert_eq!(out, vec![0x1234, -1]);

        decoder.begin(&stream(32)).unwrap();
        out.clear();
        decoder
            .decode(&(-65536i32).to_le_bytes().repeat(2), &mut out)
            .unwrap();
        assert_eq!(out, vec![-1, -1]);
    }

    #[test]
    fn test_partial_frame_rejected() {
        let mut decoder = PcmDecoder::new();
        let mut out = Vec::new();
        assert!(matches!(
            decoder.decode(&[0u8; 4], &mut out),
            Err(CodecError::NotStarted)
        ));
        decoder.begin(&stream(16)).unwrap();
        assert!(decoder.decode(&[0u8; 6], &mut out).is_err());
        assert!(out.is_empty());
    }
}
