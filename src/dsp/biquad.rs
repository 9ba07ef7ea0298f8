//! Biquad filter based on the Audio EQ Cookbook by Robert Bristow-Johnson.
//!
//! Direct Form II Transposed:
//! out = b0*x[n] + w[0]
//! w[0] = b1*x[n] - a1*out + w[1]
//! w[1] = b2*x[n] - a2*out
//!
//! Coefficients are computed separately from the filter state so the
//! smoothed-value system can hand a per-frame blend of old and new
//! coefficients to an unchanged state, which is what keeps EQ knob moves
//! click-free.

use std::f32::consts::PI;

use crate::dsp::math::flush_denormal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BiquadType {
    #[default]
    Peaking,
    LowShelf,
    HighShelf,
    Highpass,
}

/// Coefficients normalized by a0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        // Unity gain pass-through
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

impl BiquadCoeffs {
    #[inline]
    pub fn lerp(a: &Self, b: &Self, t: f32) -> Self {
        Self {
            b0: a.b0 + t * (b.b0 - a.b0),
            b1: a.b1 + t * (b.b1 - a.b1),
            b2: a.b2 + t * (b.b2 - a.b2),
            a1: a.a1 + t * (b.a1 - a.a1),
            a2: a.a2 + t * (b.a2 - a.a2),
        }
    }
}

/// Design parameters from which coefficients are computed.
#[derive(Debug, Clone, Copy)]
pub struct BiquadParams {
    pub kind: BiquadType,
    pub sample_rate: f32,
    pub fc: f32,
    pub q: f32,
    pub peak_gain_db: f32,
}

impl Default for BiquadParams {
    fn default() -> Self {
        Self {
            kind: BiquadType::Peaking,
            sample_rate: 44100.0,
            fc: 1000.0,
            q: 0.707,
            peak_gain_db: 0.0,
        }
    }
}

impl BiquadParams {
    pub fn coefficients(&self) -> BiquadCoeffs {
        let fc = self.fc.clamp(1.0, self.sample_rate * 0.49);
        let omega = 2.0 * PI * fc / self.sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let q = self.q.max(0.05);
        let alpha = sin_omega / (2.0 * q);
        let a = 10.0_f32.powf(self.peak_gain_db / 40.0);

        let (b0, b1, b2, a0, a1, a2) = match self.kind {
            BiquadType::Peaking => (
                1.0 + alpha * a,
                -2.0 * cos_omega,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_omega,
                1.0 - alpha / a,
            ),
            BiquadType::LowShelf => {
                let beta = a.sqrt() / q;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos_omega + beta * sin_omega),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_omega),
                    a * ((a + 1.0) - (a - 1.0) * cos_omega - beta * sin_omega),
                    (a + 1.0) + (a - 1.0) * cos_omega + beta * sin_omega,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_omega),
                    (a + 1.0) + (a - 1.0) * cos_omega - beta * sin_omega,
                )
            }
            BiquadType::HighShelf => {
                let beta = a.sqrt() / q;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos_omega + beta * sin_omega),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_omega),
                    a * ((a + 1.0) + (a - 1.0) * cos_omega - beta * sin_omega),
                    (a + 1.0) - (a - 1.0) * cos_omega + beta * sin_omega,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_omega),
                    (a + 1.0) - (a - 1.0) * cos_omega - beta * sin_omega,
                )
            }
            BiquadType::Highpass => (
                (1.0 + cos_omega) / 2.0,
                -(1.0 + cos_omega),
                (1.0 + cos_omega) / 2.0,
                1.0 + alpha,
                -2.0 * cos_omega,
                1.0 - alpha,
            ),
        };

        let inv_a0 = 1.0 / a0;
        BiquadCoeffs {
            b0: b0 * inv_a0,
            b1: b1 * inv_a0,
            b2: b2 * inv_a0,
            a1: a1 * inv_a0,
            a2: a2 * inv_a0,
        }
    }
}

/// Stereo filter state (Direct Form II Transposed, per channel).
#[derive(Debug, Clone, Copy, Default)]
pub struct StereoBiquadState {
    w: [[f32; 2]; 2],
}

impl StereoBiquadState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[inline]
    pub fn process(&mut self, coeffs: &BiquadCoeffs, input: (f32, f32)) -> (f32, f32) {
        let inputs = [input.0, input.1];
        let mut outputs = [0.0f32; 2];
        for ch in 0..2 {
            let x = inputs[ch];
            let out = coeffs.b0 * x + self.w[ch][0];
            self.w[ch][0] = flush_denormal(coeffs.b1 * x - coeffs.a1 * out + self.w[ch][1]);
            self.w[ch][1] = flush_denormal(coeffs.b2 * x - coeffs.a2 * out);
            outputs[ch] = out;
        }
        (outputs[0], outputs[1])
    }
}

/// One frame of a coefficient transition: the blended coefficients plus the
/// mix position in [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct SmoothedCoeffsFrame {
    pub coeffs: BiquadCoeffs,
    pub mix: f32,
}

/// Blends old coefficients into new over one block whenever the design
/// parameters change.
#[derive(Debug, Clone, Default)]
pub struct SmoothedBiquadCoeffs {
    current: BiquadCoeffs,
    old: BiquadCoeffs,
    mix: f32,
    mix_step: f32,
}

impl SmoothedBiquadCoeffs {
    pub fn set(&mut self, params: &BiquadParams) {
        self.set_coeffs(params.coefficients());
    }

    pub fn set_coeffs(&mut self, target: BiquadCoeffs) {
        if target == self.current {
            return;
        }
        // Resume from wherever a still-running transition got to.
        self.old = if self.needs_update() {
            BiquadCoeffs::lerp(&self.old, &self.current, self.mix)
        } else {
            self.current
        };
        self.current = target;
        self.mix = 0.0;
    }

    pub fn reset_smoothing(&mut self) {
        self.mix = 1.0;
    }

    #[inline]
    pub fn needs_update(&self) -> bool {
        self.mix < 1.0
    }

    /// Call once per block before reading values.
    pub fn begin_block(&mut self, block_size: u32) {
        self.mix_step = 1.0 / block_size.max(1) as f32;
    }

    /// Advance the transition by one frame.
    #[inline]
    pub fn value(&mut self) -> SmoothedCoeffsFrame {
        if !self.needs_update() {
            return SmoothedCoeffsFrame {
                coeffs: self.current,
                mix: 1.0,
            };
        }
        self.mix = (self.mix + self.mix_step).min(1.0);
        SmoothedCoeffsFrame {
            coeffs: BiquadCoeffs::lerp(&self.old, &self.current, self.mix),
            mix: self.mix,
        }
    }

    pub fn coeffs(&self) -> BiquadCoeffs {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peaking_at_zero_gain_is_transparent() {
        let params = BiquadParams {
            kind: BiquadType::Peaking,
            sample_rate: 48000.0,
            fc: 1000.0,
            q: 1.0,
            peak_gain_db: 0.0,
        };
        let coeffs = params.coefficients();
        let mut state = StereoBiquadState::default();

        for i in 0..1000 {
            let x = ((i as f32) * 0.13).sin();
            let (l, _) = state.process(&coeffs, (x, x));
            assert!((l - x).abs() < 1e-4);
        }
    }

    #[test]
    fn highpass_rejects_dc() {
        let params = BiquadParams {
            kind: BiquadType::Highpass,
            sample_rate: 48000.0,
            fc: 100.0,
            q: 0.707,
            peak_gain_db: 0.0,
        };
        let coeffs = params.coefficients();
        let mut state = StereoBiquadState::default();

        let mut out = 1.0;
        for _ in 0..48000 {
            (out, _) = state.process(&coeffs, (1.0, 1.0));
        }
        assert!(out.abs() < 1e-3, "DC leak {}", out);
    }

    #[test]
    fn smoothed_coeffs_ramp_over_one_block() {
        let mut smoothed = SmoothedBiquadCoeffs::default();
        smoothed.reset_smoothing();
        let mut params = BiquadParams::default();
        params.peak_gain_db = 12.0;
        smoothed.set(&params);
        assert!(smoothed.needs_update());

        smoothed.begin_block(64);
        let mut prev_mix = 0.0;
        for _ in 0..64 {
            let frame = smoothed.value();
            assert!(frame.mix >= prev_mix);
            prev_mix = frame.mix;
        }
        assert!((prev_mix - 1.0).abs() < 1e-6);
        assert!(!smoothed.needs_update());
    }

    #[test]
    fn setting_same_coefficients_does_not_restart_transition() {
        let mut smoothed = SmoothedBiquadCoeffs::default();
        smoothed.reset_smoothing();
        let params = BiquadParams::default();
        smoothed.set(&params);
        smoothed.begin_block(4);
        for _ in 0..4 {
            smoothed.value();
        }
        assert!(!smoothed.needs_update());
        smoothed.set(&params);
        assert!(!smoothed.needs_update());
    }
}
