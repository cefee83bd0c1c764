//! Linear volume and mute
//!
//! The session writes server-side volume/mute here; the output stage reads
//! the resulting gain once per chunk.

use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
struct VolumeState {
    /// 0..=100
    volume: u32,
    muted: bool,
    factor: f32,
}

#[derive(Debug)]
pub struct VolumeControl {
    state: RwLock<VolumeState>,
}

/// Thread-safe handle to the volume control
pub type SharedVolume = Arc<VolumeControl>;

impl VolumeControl {
    /// `factor` scales every gain on top of the server volume
    pub fn new(factor: f32) -> Self {
        Self {
            state: RwLock::new(VolumeState {
                volume: 100,
                muted: false,
                factor: factor.max(0.0),
            }),
        }
    }

    pub fn set_volume(&self, volume: u32) {
        self.state.write().volume = volume.min(100);
    }

    pub fn set_muted(&self, muted: bool) {
        let mut state = self.state.write();
        if state.muted != muted {
            tracing::info!("Output {}", if muted { "muted" } else { "unmuted" });
        }
        state.muted = muted;
    }

    pub fn volume(&self) -> u32 {
        self.state.read().volume
    }

    pub fn is_muted(&self) -> bool {
        self.state.read().muted
    }

    /// Linear gain; zero while muted
    pub fn gain(&self) -> f32 {
        let state = *self.state.read();
        if state.muted {
            0.0
        } else {
            state.volume as f32 / 100.0 * state.factor
        }
    }

    /// Scale `samples` in place by the current gain
    pub fn apply(&self, samples: &mut [i16]) {
        let gain = self.gain();
        if gain == 1.0 {
            return;
        }
        if gain == 0.0 {
            samples.fill(0);
            return;
        }
        for sample in samples.iter_mut() {
            let scaled = *sample as f32 * gain;
            *sample = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain() {
        let volume = VolumeControl::default();
        assert_eq!(volume.gain(), 1.0);
        volume.set_volume(50);
        assert_eq!(volume.gain(), 0.5);
        volume.set_volume(250);
        assert_eq!(volume.volume(), 100);
    }

    #[test]
    fn test_mute_writes_silence() {
        let volume = VolumeControl::default();
        volume.set_muted(true);
        let mut samples = vec![1000i16, -1000, i16::MAX];
        volume.apply(&mut samples);
        assert_eq!(samples, vec![0, 0, 0]);
        volume.set_muted(false);
        assert_eq!(volume.gain(), 1.0);
    }

    #[test]
    fn test_factor_clamps() {
        let volume = VolumeControl::new(2.0);
        let mut samples = vec![20_000i16, -20_000, 100];
        volume.apply(&mut samples);
        assert_eq!(samples, vec![i16::MAX, i16::MIN, 200]);
    }
}
