//! Playback speed correction by linear interpolation
//!
//! Input frames are read at `factor` frames per output frame: a factor above
//! 1.0 plays faster (fewer output frames), below 1.0 slower. The last frame of
//! each block is carried over so interpolation is continuous across chunks.

pub struct LinearResampler {
    channels: usize,
    /// Read position; index 0 is the carried frame, 1.. the current input
    pos: f64,
    prev: Vec<i16>,
}

impl LinearResampler {
    pub fn new(channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        Self {
            channels,
            pos: 1.0,
            prev: vec![0; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn reset(&mut self, channels: u16) {
        *self = Self::new(channels);
    }

    /// Append the resampled form of `input` to `out`
    pub fn process(&mut self, input: &[i16], factor: f64, out: &mut Vec<i16>) {
        let channels = self.channels;
        let frames = input.len() / channels;
        if frames == 0 {
            return;
        }
        let input = &input[..frames * channels];

        if factor == 1.0 || !factor.is_finite() || factor <= 0.0 {
            out.extend_from_slice(input);
            self.pos = 1.0;
            self.prev.copy_from_slice(&input[(frames - 1) * channels..]);
            return;
        }

        let sample_at = |frame: usize, channel: usize| -> f64 {
            if frame == 0 {
                self.prev[channel] as f64
            } else {
                input[(frame - 1) * channels + channel] as f64
            }
        };

        out.reserve((frames as f64 / factor) as usize * channels + channels);
        let mut pos = self.pos;
        while pos < frames as f64 {
            let index = pos as usize;
            let frac = pos - index as f64;
            for channel in 0..channels {
                let a = sample_at(index, channel);
                let b = sample_at(index + 1, channel);
                out.push((a + (b - a) * frac).round() as i16);
            }
            pos += factor;
        }

        self.pos = pos - frames as f64;
        self.prev.copy_from_slice(&input[(frames - 1) * channels..]);
    }
}
