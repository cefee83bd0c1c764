//! Stream formats announced by codec headers
//!
//! A codec header names the codec and carries codec-specific bytes. The
//! sample rate, channel count and bit depth are recovered from those bytes
//! where the layout is known (opus, pcm/WAV, flac).

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

use crate::constants::{DEFAULT_BITS_PER_SAMPLE, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::error::ProtocolError;
use crate::protocol::messages::CodecHeader;

/// Marker at the start of the opus pseudo header ("OPUS" as a LE u32)
pub const OPUS_HEADER_ID: u32 = 0x4F50_5553;

/// Codecs a Snapcast server may announce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Pcm,
    Flac,
    Ogg,
    Opus,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Pcm => "pcm",
            Codec::Flac => "flac",
            Codec::Ogg => "ogg",
            Codec::Opus => "opus",
        }
    }
}

impl FromStr for Codec {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pcm" => Ok(Codec::Pcm),
            "flac" => Ok(Codec::Flac),
            "ogg" => Ok(Codec::Ogg),
            "opus" => Ok(Codec::Opus),
            other => Err(ProtocolError::UnsupportedCodec(other.to_string())),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// PCM format of the decoded stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// Bytes per interleaved frame
    pub fn frame_size(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Duration of `bytes` of raw PCM in milliseconds
    pub fn duration_ms(&self, bytes: usize) -> f64 {
        let frame = self.frame_size().max(1);
        (bytes / frame) as f64 * 1000.0 / self.sample_rate.max(1) as f64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS, DEFAULT_BITS_PER_SAMPLE)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{}bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

/// A stream announced by a codec header: which codec, the resulting PCM
/// format and the raw header bytes for the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub codec: Codec,
    pub format: AudioFormat,
    pub header: Bytes,
}

impl StreamSpec {
    /// Interpret a codec header message
    pub fn from_codec_header(message: &CodecHeader) -> Result<Self, ProtocolError> {
        let codec: Codec = message.codec.parse()?;
        let header = message.payload.clone();
        let format = match codec {
            Codec::Opus => parse_opus_header(&header)?,
            Codec::Pcm => parse_wav_header(&header)?,
            Codec::Flac => parse_flac_header(&header)?,
            Codec::Ogg => AudioFormat::default(),
        };
        Ok(Self {
            codec,
            format,
            header,
        })
    }
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Opus pseudo header: `[id u32][rate u32][bits u16][channels u16]`
pub fn parse_opus_header(data: &[u8]) -> Result<AudioFormat, ProtocolError> {
    if data.len() < 12 {
        return Err(ProtocolError::Truncated {
            needed: 12,
            available: data.len(),
        });
    }
    let sample_rate = read_u32(data, 4).unwrap_or_default();
    let bits_per_sample = read_u16(data, 8).unwrap_or_default();
    let channels = read_u16(data, 10).unwrap_or_default();
    if sample_rate == 0 || channels == 0 {
        return Err(ProtocolError::Malformed(format!(
            "opus header: rate {} channels {}",
            sample_rate, channels
        )));
    }
    Ok(AudioFormat::new(sample_rate, channels, bits_per_sample))
}

/// Build the opus pseudo header for `format`
pub fn opus_header(format: &AudioFormat) -> Bytes {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&OPUS_HEADER_ID.to_le_bytes());
    data.extend_from_slice(&format.sample_rate.to_le_bytes());
    data.extend_from_slice(&format.bits_per_sample.to_le_bytes());
    data.extend_from_slice(&format.channels.to_le_bytes());
    Bytes::from(data)
}

/// RIFF/WAVE header: walk the chunks up to `fmt `
pub fn parse_wav_header(data: &[u8]) -> Result<AudioFormat, ProtocolError> {
    if data.len() < 12 {
        return Err(ProtocolError::Truncated {
            needed: 12,
            available: data.len(),
        });
    }
    if &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return Err(ProtocolError::Malformed("pcm header is not RIFF/WAVE".into()));
    }

    let mut pos = 12;
    while pos + 8 <= data.len() {
        let id = &data[pos..pos + 4];
        let len = read_u32(data, pos + 4).unwrap_or_default() as usize;
        let body = pos + 8;
        if id == b"fmt " {
            let (Some(channels), Some(sample_rate), Some(bits)) = (
                read_u16(data, body + 2),
                read_u32(data, body + 4),
                read_u16(data, body + 14),
            ) else {
                return Err(ProtocolError::Truncated {
                    needed: body + 16,
                    available: data.len(),
                });
            };
            return Ok(AudioFormat::new(sample_rate, channels, bits));
        }
        pos = body + len + (len & 1);
    }
    Err(ProtocolError::Malformed("pcm header has no fmt chunk".into()))
}

/// Build a canonical 44-byte WAV header for `format`
pub fn wav_header(format: &AudioFormat) -> Bytes {
    let block_align = format.frame_size() as u16;
    let byte_rate = format.sample_rate * block_align as u32;
    let mut data = Vec::with_capacity(44);
    data.extend_from_slice(b"RIFF");
    data.extend_from_slice(&36u32.to_le_bytes());
    data.extend_from_slice(b"WAVE");
    data.extend_from_slice(b"fmt ");
    data.extend_from_slice(&16u32.to_le_bytes());
    data.extend_from_slice(&1u16.to_le_bytes());
    data.extend_from_slice(&format.channels.to_le_bytes());
    data.extend_from_slice(&format.sample_rate.to_le_bytes());
    data.extend_from_slice(&byte_rate.to_le_bytes());
    data.extend_from_slice(&block_align.to_le_bytes());
    data.extend_from_slice(&format.bits_per_sample.to_le_bytes());
    data.extend_from_slice(b"data");
    data.extend_from_slice(&0u32.to_le_bytes());
    Bytes::from(data)
}

/// FLAC stream header: "fLaC" followed by the STREAMINFO block
pub fn parse_flac_header(data: &[u8]) -> Result<AudioFormat, ProtocolError> {
    if data.len() < 22 {
        return Err(ProtocolError::Truncated {
            needed: 22,
            available: data.len(),
        });
    }
    if &data[0..4] != b"fLaC" {
        return Err(ProtocolError::Malformed("flac header lacks fLaC marker".into()));
    }
    // STREAMINFO: 10 bytes of block/frame sizes, then 20 bits rate,
    // 3 bits channels - 1, 5 bits bits-per-sample - 1
    let info = &data[8..];
    let sample_rate =
        ((info[10] as u32) << 12) | ((info[11] as u32) << 4) | ((info[12] as u32) >> 4);
    let channels = ((info[12] >> 1) & 0x07) as u16 + 1;
    let bits_per_sample = ((((info[12] & 0x01) << 4) | (info[13] >> 4)) as u16) + 1;
    Ok(AudioFormat::new(sample_rate, channels, bits_per_sample))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opus_header_layout() {
        let format = AudioFormat::new(48000, 2, 16);
        let header = opus_header(&format);
        assert_eq!(header.len(), 12);
        assert_eq!(&header[4..8], &48000u32.to_le_bytes());
        assert_eq!(&header[8..10], &16u16.to_le_bytes());
        assert_eq!(&header[10..12], &2u16.to_le_bytes());
        assert_eq!(parse_opus_header(&header).unwrap(), format);
    }

    #[test]
    fn test_opus_header_truncated() {
        assert!(matches!(
            parse_opus_header(&[0u8; 8]),
            Err(ProtocolError::Truncated { needed: 12, .. })
        ));
    }

    #[test]
    fn test_wav_header() {
        let format = AudioFormat::new(44100, 2, 16);
        let header = wav_header(&format);
        assert_eq!(header.len(), 44);
        assert_eq!(parse_wav_header(&header).unwrap(), format);
        assert!(parse_wav_header(b"RIFX\0\0\0\0WAVE").is_err());
    }

    #[test]
    fn test_flac_header() {
        // STREAMINFO for 44100 Hz, 2 channels, 16 bits
        let mut data = vec![0u8; 42];
        data[0..4].copy_from_slice(b"fLaC");
        data[4] = 0x80;
        data[7] = 34;
        let rate: u32 = 44100;
        data[18] = (rate >> 12) as u8;
        data[19] = (rate >> 4) as u8;
        data[20] = (((rate & 0x0F) << 4) as u8) | ((2 - 1) << 1) | ((16 - 1) >> 4);
        data[21] = ((16 - 1) & 0x0F) << 4;
        assert_eq!(parse_flac_header(&data).unwrap(), AudioFormat::new(44100, 2, 16));
    }

    #[test]
    fn test_codec_names() {
        for codec in [Codec::Pcm, Codec::Flac, Codec::Ogg, Codec::Opus] {
            assert_eq!(codec.name().parse::<Codec>().unwrap(), codec);
        }
        assert_eq!(
            "mp3".parse::<Codec>(),
            Err(ProtocolError::UnsupportedCodec("mp3".into()))
        );
    }

    #[test]
    fn test_duration() {
        let format = AudioFormat::new(48000, 2, 16);
        assert_eq!(format.frame_size(), 4);
        assert!((format.duration_ms(3840) - 20.0).abs() < f64::EPSILON);
    }
}
