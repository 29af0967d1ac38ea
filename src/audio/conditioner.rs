//! Capture conditioning
//!
//! Two stages, split by where they run:
//! - [`Normalizer`] runs in the capture callback and turns native batches into canonical
//!   48 kHz interleaved stereo f32.
//! - [`GainStage`] runs once per paced frame: fixed gain, attenuation-only peak limiter,
//!   then symmetric conversion to i16.

use crate::audio::source::SourceFormat;
use crate::constants::SAMPLE_RATE;

/// Peaks below this are treated as silence by the limiter
const SILENCE_FLOOR: f32 = 1e-9;

/// Convert decibels to a linear amplitude factor
pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Channel remap plus linear-interpolation resampling to the canonical format
pub struct Normalizer {
    in_channels: usize,
    /// Input frames advanced per output frame
    step: f64,
    /// Fractional position between `prev` and the next input frame
    pos: f64,
    prev: [f32; 2],
    passthrough: bool,
}

impl Normalizer {
    pub fn new(format: SourceFormat) -> Self {
        let in_rate = format.sample_rate.max(1);
        Self {
            in_channels: format.channels.max(1) as usize,
            step: in_rate as f64 / SAMPLE_RATE as f64,
            pos: 0.0,
            prev: [0.0; 2],
            passthrough: in_rate == SAMPLE_RATE,
        }
    }

    /// Mono is duplicated; more than two channels keep channels 0 and 1
    fn stereo(&self, frame: &[f32]) -> [f32; 2] {
        match self.in_channels {
            1 => [frame[0], frame[0]],
            _ => [frame[0], frame[1]],
        }
    }

    /// Append the canonical rendition of `input` to `out`
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        for frame in input.chunks_exact(self.in_channels) {
            let cur = self.stereo(frame);
            if self.passthrough {
                out.extend_from_slice(&cur);
                continue;
            }

            while self.pos < 1.0 {
                let t = self.pos as f32;
                out.push(self.prev[0] + (cur[0] - self.prev[0]) * t);
                out.push(self.prev[1] + (cur[1] - self.prev[1]) * t);
                self.pos += self.step;
            }
            self.pos -= 1.0;
            self.prev = cur;
        }
    }
}

/// Fixed gain with an attenuation-only peak limiter
#[derive(Debug, Clone, Copy)]
pub struct GainStage {
    gain: f32,
    ceiling: f32,
}

impl GainStage {
    pub fn new(gain: f32, ceiling: f32) -> Self {
        Self { gain, ceiling }
    }

    pub fn from_db(gain_db: f32, ceiling_dbfs: f32) -> Self {
        Self::new(db_to_linear(gain_db), db_to_linear(ceiling_dbfs))
    }

    /// Gain to apply to a frame with the given peak; never above the configured gain
    pub fn effective_gain(&self, peak: f32) -> f32 {
        if peak > SILENCE_FLOOR {
            let post_peak = peak * self.gain;
            if post_peak > self.ceiling {
                return self.gain * (self.ceiling / post_peak);
            }
        }
        self.gain
    }

    /// Limit and convert one frame, returning the gain that was applied
    pub fn process(&self, input: &[f32], out: &mut [i16]) -> f32 {
        debug_assert_eq!(input.len(), out.len());
        let peak = input.iter().fold(0f32, |peak, s| peak.max(s.abs()));
        let gain = self.effective_gain(peak);
        for (dst, &sample) in out.iter_mut().zip(input) {
            *dst = to_i16(sample * gain);
        }
        gain
    }
}

/// Symmetric conversion: [-1.0, 1.0] maps onto [-32767, 32767]
fn to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32).round() as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_db_to_linear() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(-6.0) - 0.501_187).abs() < 1e-4);
        assert!((db_to_linear(-1.0) - 0.891_25).abs() < 1e-4);
    }

    #[test]
    fn test_limiter_meets_ceiling() {
        let stage = GainStage::new(db_to_linear(6.0), db_to_linear(-1.0));
        let gain = stage.effective_gain(0.9);
        assert!((0.9 * gain - db_to_linear(-1.0)).abs() < 1e-5);
    }

    #[test]
    fn test_limiter_passes_quiet_frames() {
        let stage = GainStage::new(1.0, db_to_linear(-1.0));
        assert_eq!(stage.effective_gain(0.25), 1.0);
        assert_eq!(stage.effective_gain(0.0), 1.0);
    }

    #[test]
    fn test_conversion_is_symmetric() {
        let stage = GainStage::new(1.0, 4.0);
        let mut out = [0i16; 4];
        stage.process(&[1.5, -1.5, 0.5, -0.5], &mut out);
        assert_eq!(out[0], 32767);
        assert_eq!(out[1], -32767);
        assert_eq!(out[2], -out[3]);
    }

    #[test]
    fn test_mono_duplicated() {
        let mut norm = Normalizer::new(SourceFormat { sample_rate: 48000, channels: 1 });
        let mut out = Vec::new();
        norm.process(&[0.1, 0.2], &mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_surround_keeps_front_pair() {
        let mut norm = Normalizer::new(SourceFormat { sample_rate: 48000, channels: 6 });
        let mut out = Vec::new();
        norm.process(&[0.1, 0.2, 0.9, 0.9, 0.9, 0.9, 0.3, 0.4, 0.9, 0.9, 0.9, 0.9], &mut out);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_resample_ratio() {
        let mut norm = Normalizer::new(SourceFormat { sample_rate: 44100, channels: 2 });
        let input = vec![0.0f32; 44100 * 2];
        let mut out = Vec::new();
        for chunk in input.chunks(882) {
            norm.process(chunk, &mut out);
        }
        let frames = out.len() / 2;
        assert!((47_990..=48_010).contains(&frames), "got {} frames", frames);
    }

    #[test]
    fn test_resample_interpolates() {
        let mut norm = Normalizer::new(SourceFormat { sample_rate: 24000, channels: 1 });
        let mut out = Vec::new();
        norm.process(&[1.0, 1.0], &mut out);
        // first output pair starts from the zero history, then halfway up
        assert_eq!(&out[..4], &[0.0, 0.0, 0.5, 0.5]);
    }

    proptest! {
        #[test]
        fn prop_limiter_never_boosts(
            peak in 0.0f32..4.0,
            gain_db in -40.0f32..24.0,
            ceiling_dbfs in -40.0f32..0.0,
        ) {
            let stage = GainStage::from_db(gain_db, ceiling_dbfs);
            let configured = db_to_linear(gain_db);
            let applied = stage.effective_gain(peak);
            prop_assert!(applied <= configured);
            prop_assert!(peak * applied <= db_to_linear(ceiling_dbfs) * 1.0001 || peak * configured <= db_to_linear(ceiling_dbfs));
        }
    }
}
