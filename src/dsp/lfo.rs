//! Table-driven LFO.
//!
//! Phase is a 32-bit fixed-point counter: the top 8 bits index a 256-entry
//! waveform table (which overflows and wraps automatically), the bottom 24
//! bits linearly interpolate to the next entry. The table has one extra guard
//! entry so `table[256]` never needs a modulo.

use crate::dsp::math::{lerp, sin_turns};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LfoWaveform {
    #[default]
    None,
    Sine,
    Triangle,
    Sawtooth,
    Square,
}

#[derive(Clone)]
pub struct Lfo {
    pub waveform: LfoWaveform,
    pub phase: u32,
    phase_increment_per_tick: u32,
    table: [f32; 257],
}

impl Default for Lfo {
    fn default() -> Self {
        Self {
            waveform: LfoWaveform::None,
            phase: 0,
            phase_increment_per_tick: 0,
            table: [0.0; 257],
        }
    }
}

impl Lfo {
    /// Returns a value in [-1, 1].
    #[inline]
    pub fn tick(&mut self) -> f32 {
        let index = (self.phase >> 24) as usize;
        let frac = (self.phase & 0x00FF_FFFF) as f32 * (1.0 / (1 << 24) as f32);

        self.phase = self.phase.wrapping_add(self.phase_increment_per_tick);

        lerp(self.table[index], self.table[index + 1], frac)
    }

    pub fn set_rate(&mut self, sample_rate: f32, rate_hz: f32) {
        self.phase_increment_per_tick =
            ((256.0 * rate_hz / sample_rate) * (1 << 24) as f32) as u32;
    }

    pub fn set_waveform(&mut self, waveform: LfoWaveform) {
        match waveform {
            LfoWaveform::Sine => {
                for i in 0..=256 {
                    self.table[i] = sin_turns(i as f32 / 256.0);
                }
            }
            LfoWaveform::Triangle => {
                for i in 0..64 {
                    self.table[i] = i as f32 / 64.0;
                    self.table[i + 64] = (64 - i) as f32 / 64.0;
                    self.table[i + 128] = -(i as f32) / 64.0;
                    self.table[i + 192] = -((64 - i) as f32) / 64.0;
                }
                self.table[256] = 0.0;
            }
            LfoWaveform::Sawtooth => {
                for i in 0..256 {
                    self.table[i] = 2.0 * (i as f32 / 255.0) - 1.0;
                }
                self.table[256] = -1.0;
            }
            LfoWaveform::Square => {
                for i in 0..128 {
                    self.table[i] = 1.0;
                    self.table[i + 128] = -1.0;
                }
                self.table[256] = 1.0;
            }
            LfoWaveform::None => {}
        }
        self.waveform = waveform;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_cycle_has_expected_shape() {
        let mut lfo = Lfo::default();
        lfo.set_waveform(LfoWaveform::Sine);
        // One cycle over 256 ticks.
        lfo.set_rate(256.0, 1.0);

        let first = lfo.tick();
        assert!(first.abs() < 1e-3);

        // Advance to the quarter point: peak of the sine.
        for _ in 0..63 {
            lfo.tick();
        }
        let peak = lfo.tick();
        assert!(peak > 0.99, "expected peak, got {}", peak);
    }

    #[test]
    fn output_stays_in_range_for_all_waveforms() {
        for waveform in [
            LfoWaveform::Sine,
            LfoWaveform::Triangle,
            LfoWaveform::Sawtooth,
            LfoWaveform::Square,
        ] {
            let mut lfo = Lfo::default();
            lfo.set_waveform(waveform);
            lfo.set_rate(48000.0, 5.5);
            for _ in 0..10_000 {
                let v = lfo.tick();
                assert!((-1.0..=1.0).contains(&v), "{:?} out of range: {}", waveform, v);
            }
        }
    }

    #[test]
    fn rate_controls_cycle_length() {
        let mut lfo = Lfo::default();
        lfo.set_waveform(LfoWaveform::Sawtooth);
        lfo.set_rate(48000.0, 2.0);

        // After exactly one cycle the phase returns near its start (the
        // truncated increment may leave it just shy of the full wrap).
        let start_phase = lfo.phase;
        for _ in 0..24000 {
            lfo.tick();
        }
        let increment = (256.0 * 2.0 / 48000.0 * (1 << 24) as f32) as u32;
        let diff = lfo.phase.wrapping_sub(start_phase);
        assert!(
            diff < 2 * increment || diff > u32::MAX - 2 * increment,
            "phase {} not near a full cycle",
            diff
        );
    }

    #[test]
    fn phase_wraps_without_overflow_panic() {
        let mut lfo = Lfo::default();
        lfo.set_waveform(LfoWaveform::Square);
        lfo.phase = u32::MAX - 10;
        lfo.set_rate(1000.0, 100.0);
        for _ in 0..100 {
            lfo.tick();
        }
    }
}
